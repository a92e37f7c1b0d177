use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub site: i32,
    #[sea_orm(primary_key, auto_increment = false)]
    pub ilon: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub ilat: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub time: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub outage_ix: i32,
    pub etr: Option<i64>, // -1 = expired
    pub cust_a: i64,
    pub cause: Option<i32>,
    pub crew_status: Option<i32>,
    pub reported_problem: Option<i32>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
