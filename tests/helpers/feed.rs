use async_trait::async_trait;
use outage_harvest::fetch::{OutageFeed, Reply};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Script {
    replies: HashMap<String, VecDeque<Reply>>,
    log: Vec<String>,
}

/// In-memory outage feed.
///
/// Replies are queued per URL and the last queued reply repeats. URLs with no
/// script answer `NoData`, the way the real feed answers 403. Clones share the
/// same script and request log.
#[derive(Clone, Default)]
pub struct ScriptedFeed {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, url: &str, reply: Reply) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .replies
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn body(&self, url: &str, body: String) -> &Self {
        self.reply(url, Reply::Success(body))
    }

    /// Every URL requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn count(&self, url: &str) -> usize {
        self.requests().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl OutageFeed for ScriptedFeed {
    async fn get(&self, url: &str) -> Reply {
        let mut script = self.inner.lock().unwrap();
        script.log.push(url.to_string());
        match script.replies.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Reply::NoData),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::NoData),
            None => Reply::NoData,
        }
    }
}
