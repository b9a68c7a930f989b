use chrono::Utc;
use log::error;
use rocket::http::uri::Origin;
use rocket::serde::json::Json;
use rocket::{delete, get, post, put};

use crate::errors::Error;
use crate::macros::request_caching::{cache_response, read_cache_request};
use crate::modules::models::driver::{
    sanitize_name, Driver, DriverConfig, DriverStats, DriverUpdate, LeaderboardEntry,
};
use crate::modules::models::general::establish_connection;
use crate::modules::redis::Redis;
use crate::routes::api::ApiResult;

/**************************************************************************************************/
/**************** ROUTES **************************************************************************/
/**************************************************************************************************/

/// active roster only; retired drivers stay hidden but keep their laps.
#[get("/drivers")]
pub fn list() -> ApiResult<Vec<Driver>> {
    let conn = &mut establish_connection();

    let drivers = Driver::get_all_active(conn)?;
    Ok(Json(drivers))
}

#[get("/drivers/<driver_id>", rank = 1)]
pub fn get_one(driver_id: i32) -> ApiResult<Driver> {
    let conn = &mut establish_connection();

    let driver = Driver::get_by_id(conn, driver_id)?;
    Ok(Json(driver))
}

#[post("/drivers", data = "<config>")]
pub fn create(config: Json<DriverConfig>) -> ApiResult<Driver> {
    let config = config.into_inner();

    // check if the input is valid
    let sanitized = sanitize_name(&config.name);
    if sanitized.is_empty() || sanitized != config.name {
        return Err(Error::ValidationError {
            details: format!("invalid driver name: {}", config.name),
        }
        .into());
    }

    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let driver = Driver::new(conn, config, now)?;
    driver.clear_cache_async();

    Ok(Json(driver))
}

#[put("/drivers/<driver_id>", data = "<update>")]
pub fn update(driver_id: i32, update: Json<DriverUpdate>) -> ApiResult<Driver> {
    let update = update.into_inner();

    if let Some(name) = &update.name {
        let sanitized = sanitize_name(name);
        if sanitized.is_empty() || &sanitized != name {
            return Err(Error::ValidationError {
                details: format!("invalid driver name: {}", name),
            }
            .into());
        }
    }

    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let mut driver = Driver::get_by_id(conn, driver_id)?;
    driver.apply_update(&update, now);
    let driver = driver.persist(conn)?;
    driver.clear_cache_async();

    Ok(Json(driver))
}

/// soft delete: the flag flips, the row and the lap history stay.
#[delete("/drivers/<driver_id>")]
pub fn delete(driver_id: i32) -> ApiResult<Driver> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let mut driver = Driver::get_by_id(conn, driver_id)?;
    let driver = driver.soft_delete(conn, now)?;

    Ok(Json(driver))
}

#[get("/drivers/<driver_id>/stats")]
pub fn stats(driver_id: i32, origin: &Origin) -> ApiResult<DriverStats> {
    read_cache_request!(origin);

    let conn = &mut establish_connection();
    let driver = Driver::get_by_id(conn, driver_id)?;
    let stats = driver.get_stats(conn)?;

    cache_response!(origin, stats);
}

#[post("/drivers/<driver_id>/reset-stats")]
pub fn reset_stats(driver_id: i32) -> ApiResult<Driver> {
    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();

    let mut driver = Driver::get_by_id(conn, driver_id)?;
    driver.reset_stats(now);
    let driver = driver.persist(conn)?;
    driver.clear_cache_async();

    Ok(Json(driver))
}

/// top 10 by total time; more laps break ties.
#[get("/drivers/leaderboard/overall")]
pub fn leaderboard(origin: &Origin) -> ApiResult<Vec<LeaderboardEntry>> {
    read_cache_request!(origin);

    let conn = &mut establish_connection();
    let entries = Driver::leaderboard(conn, 10)?;

    cache_response!(origin, entries);
}

/// stats rebuilt from the lap history instead of the cached aggregates.
#[get("/drivers/stats/calculated")]
pub fn stats_calculated(origin: &Origin) -> ApiResult<Vec<Driver>> {
    read_cache_request!(origin);

    let conn = &mut establish_connection();
    let now = Utc::now().naive_utc();
    let calculated = Driver::calculated_stats(conn, now)?;

    cache_response!(origin, calculated);
}
