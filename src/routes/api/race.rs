use chrono::Utc;
use log::error;
use rocket::http::uri::Origin;
use rocket::serde::json::Json;
use rocket::{delete, get, post, put};
use serde::{Deserialize, Serialize};

use crate::macros::request_caching::{cache_response, read_cache_request};
use crate::modules::models::driver::Driver;
use crate::modules::models::general::establish_connection;
use crate::modules::models::race::{Race, RaceConfig, RaceStats, RaceUpdate};
use crate::modules::redis::Redis;
use crate::routes::api::ApiResult;

/**************************************************************************************************/
/**************** ROUTES **************************************************************************/
/**************************************************************************************************/

#[get("/races")]
pub fn list() -> ApiResult<Vec<Race>> {
    let conn = &mut establish_connection();

    let races = Race::get_all(conn)?;
    Ok(Json(races))
}

#[get("/races/<race_id>")]
pub fn get_one(race_id: i32) -> ApiResult<Race> {
    let conn = &mut establish_connection();

    let race = Race::get_by_id(conn, race_id)?;
    Ok(Json(race))
}

#[post("/races", data = "<config>")]
pub fn create(config: Json<RaceConfig>) -> ApiResult<Race> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let race = Race::new(conn, config.into_inner(), now)?;
    Ok(Json(race))
}

#[put("/races/<race_id>", data = "<update>")]
pub fn update(race_id: i32, update: Json<RaceUpdate>) -> ApiResult<Race> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let mut race = Race::get_by_id(conn, race_id)?;
    race.apply_update(&update, now);
    let race = race.persist(conn)?;

    Ok(Json(race))
}

#[delete("/races/<race_id>")]
pub fn delete(race_id: i32) -> ApiResult<Race> {
    let conn = &mut establish_connection();

    let race = Race::get_by_id(conn, race_id)?;
    race.delete(conn)?;

    Ok(Json(race))
}

#[post("/races/<race_id>/start")]
pub fn start(race_id: i32) -> ApiResult<Race> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let mut race = Race::get_by_id(conn, race_id)?;
    race.start(now)?;
    let race = race.persist(conn)?;

    Ok(Json(race))
}

#[post("/races/<race_id>/pause")]
pub fn pause(race_id: i32) -> ApiResult<Race> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let mut race = Race::get_by_id(conn, race_id)?;
    race.pause(now)?;
    let race = race.persist(conn)?;

    Ok(Json(race))
}

#[post("/races/<race_id>/finish")]
pub fn finish(race_id: i32) -> ApiResult<Race> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let mut race = Race::get_by_id(conn, race_id)?;
    race.finish(now)?;
    let race = race.persist(conn)?;

    Ok(Json(race))
}

/// abandons the race and hands back a fresh pending one with the same
/// name, team and settings.
#[post("/races/<race_id>/reset")]
pub fn reset(race_id: i32) -> ApiResult<Race> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let race = Race::get_by_id(conn, race_id)?;
    let replacement = race.reset(conn, now)?;

    Ok(Json(replacement))
}

#[post("/races/<race_id>/change-driver", data = "<data>")]
pub fn change_driver(race_id: i32, data: Json<ChangeDriverData>) -> ApiResult<Race> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    // the driver must exist before it becomes the race's current pointer
    let driver = Driver::get_by_id(conn, data.driver_id)?;

    let mut race = Race::get_by_id(conn, race_id)?;
    race.change_driver(driver.id, now)?;
    let race = race.persist(conn)?;

    Ok(Json(race))
}

#[get("/races/<race_id>/stats")]
pub fn stats(race_id: i32, origin: &Origin) -> ApiResult<RaceStats> {
    read_cache_request!(origin);

    let conn = &mut establish_connection();
    let race = Race::get_by_id(conn, race_id)?;
    let stats = race.get_stats(conn)?;

    cache_response!(origin, stats);
}

/**************************************************************************************************/
/**************** HELPERS *************************************************************************/
/**************************************************************************************************/

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDriverData {
    pub driver_id: i32,
}
