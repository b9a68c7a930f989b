use chrono::{NaiveDateTime, Utc};
use log::error;
use rocket::http::uri::Origin;
use rocket::serde::json::Json;
use rocket::{delete, get, post, put};
use serde::{Deserialize, Serialize};

use crate::macros::request_caching::{cache_response, read_cache_request};
use crate::modules::models::general::establish_connection;
use crate::modules::models::lap::{Lap, LapCreate};
use crate::modules::redis::Redis;
use crate::routes::api::ApiResult;

/**************************************************************************************************/
/**************** ROUTES **************************************************************************/
/**************************************************************************************************/

#[get("/laps?<race>&<driver>&<limit>")]
pub fn list(race: Option<i32>, driver: Option<i32>, limit: Option<i64>) -> ApiResult<Vec<Lap>> {
    let conn = &mut establish_connection();

    let laps = Lap::get_filtered(conn, race, driver, limit.unwrap_or(50))?;
    Ok(Json(laps))
}

#[get("/laps/<lap_id>", rank = 1)]
pub fn get_one(lap_id: i32) -> ApiResult<Lap> {
    let conn = &mut establish_connection();

    let lap = Lap::from_id(conn, lap_id)?;
    Ok(Json(lap))
}

/// direct insertion for imports and corrections; numbering and totals are
/// still assigned server side and the aggregates updated the same way.
#[post("/laps", data = "<data>")]
pub fn create(data: Json<LapCreate>) -> ApiResult<Lap> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let lap = Lap::create(conn, data.into_inner(), now)?;
    Ok(Json(lap))
}

/// amend a recorded lap. a changed time re-derives the owning driver's
/// aggregates and rebases the race's running totals.
#[put("/laps/<lap_id>", data = "<data>")]
pub fn update(lap_id: i32, data: Json<LapAmend>) -> ApiResult<Lap> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();
    let data = data.into_inner();

    let current = Lap::from_id(conn, lap_id)?;
    let new_lap_time = data.lap_time.unwrap_or(current.lap_time);

    let lap = Lap::amend_stint(conn, lap_id, new_lap_time, data.notes, now)?;
    Ok(Json(lap))
}

/// delete a recorded lap and roll its aggregates back.
#[delete("/laps/<lap_id>")]
pub fn delete(lap_id: i32) -> ApiResult<Lap> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let lap = Lap::from_id(conn, lap_id)?;
    Lap::delete_stint(conn, lap_id, now)?;

    Ok(Json(lap))
}

/// the validated stint-completion entry point: requires a running race
/// with an open stint, closes it and records the lap.
#[post("/laps/record", data = "<data>")]
pub fn record(data: Json<RecordStintData>) -> ApiResult<Lap> {
    let conn = &mut establish_connection();
    let data = data.into_inner();

    let stint_end = data.stint_end.unwrap_or_else(|| Utc::now().naive_utc());
    let lap = Lap::record_stint(
        conn,
        data.race_id,
        data.driver_id,
        data.stint_start,
        stint_end,
        data.notes.unwrap_or_default(),
    )?;

    Ok(Json(lap))
}

#[get("/laps/race/<race_id>")]
pub fn of_race(race_id: i32) -> ApiResult<Vec<Lap>> {
    let conn = &mut establish_connection();

    let laps = Lap::from_race(conn, race_id)?;
    Ok(Json(laps))
}

#[get("/laps/driver/<driver_id>?<limit>")]
pub fn of_driver(driver_id: i32, limit: Option<i64>) -> ApiResult<Vec<Lap>> {
    let conn = &mut establish_connection();

    let laps = Lap::from_driver(conn, driver_id, Some(limit.unwrap_or(20)))?;
    Ok(Json(laps))
}

#[get("/laps/best/overall?<limit>")]
pub fn best_overall(limit: Option<i64>, origin: &Origin) -> ApiResult<Vec<Lap>> {
    read_cache_request!(origin);

    let conn = &mut establish_connection();
    let best = Lap::best_overall(conn, limit.unwrap_or(10))?;

    cache_response!(origin, best);
}

#[get("/laps/best/race/<race_id>?<limit>")]
pub fn best_of_race(race_id: i32, limit: Option<i64>, origin: &Origin) -> ApiResult<Vec<Lap>> {
    read_cache_request!(origin);

    let conn = &mut establish_connection();
    let best = Lap::best_of_race(conn, race_id, limit.unwrap_or(5))?;

    cache_response!(origin, best);
}

/**************************************************************************************************/
/**************** HELPERS *************************************************************************/
/**************************************************************************************************/

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RecordStintData {
    pub race_id: i32,
    pub driver_id: i32,
    /// defaults to the race's open stint start
    #[serde(default)]
    pub stint_start: Option<NaiveDateTime>,
    /// defaults to now
    #[serde(default)]
    pub stint_end: Option<NaiveDateTime>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct LapAmend {
    pub lap_time: Option<i64>,
    pub notes: Option<String>,
}
