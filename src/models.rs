use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use crate::schema::*;


#[derive(Insertable, Serialize, Debug, Clone, Deserialize)]
#[diesel(table_name = drivers)]
pub struct NewDriver {
    pub name: String,
    pub color: String,
    pub profile_image: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Serialize, Debug, Clone, Deserialize)]
#[diesel(table_name = races)]
pub struct NewRace {
    pub name: String,
    pub team_name: String,
    pub duration: i32,
    pub status: String,
    pub min_stint_time: i32,
    pub max_stint_time: i32,
    pub target_laps: i32,
    pub city: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Serialize, Debug, Clone, Deserialize)]
#[diesel(table_name = laps)]
pub struct NewLap {
    pub race: i32,
    pub driver: i32,
    pub driver_name: String,
    pub lap_number: i32,
    pub lap_time: i64,
    pub total_time: i64,
    pub stint_start_time: NaiveDateTime,
    pub stint_end_time: NaiveDateTime,
    pub notes: String,
    pub created_at: NaiveDateTime,
}
