pub mod event;
pub mod job;

pub use event::Entity as Event;
pub use job::Entity as Job;
