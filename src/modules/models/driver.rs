use std::collections::HashSet;
use std::thread;

use chrono::NaiveDateTime;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use log::error;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{CustomResult, DriverNotFoundSnafu, InconsistentStateSnafu};
use crate::macros::redis::{clear_cache, delete_keys};
use crate::models::NewDriver;
use crate::modules::models::lap::Lap;
use crate::modules::redis::Redis;
use crate::schema::drivers;

/// strip everything that is not a plain name character.
/// used to reject suspicious input before it reaches a query.
pub fn sanitize_name(name: &str) -> String {
    let pattern = Regex::new(r"[^A-Za-z0-9 '\-_]").unwrap();
    pattern.replace_all(name.trim(), "").to_string()
}

/// Fields accepted when creating a driver.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub profile_image: Option<String>,
}

fn default_color() -> String {
    "#1f2937".to_string()
}

/// Fields accepted when updating a driver. Aggregates are owned by the
/// recorder and cannot be set from the outside.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DriverUpdate {
    pub name: Option<String>,
    pub color: Option<String>,
    pub profile_image: Option<String>,
}

#[derive(Queryable, Identifiable, AsChangeset, Serialize, Deserialize, PartialEq, Debug, Clone)]
#[diesel(table_name = drivers, treat_none_as_null = true)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: i32,
    pub name: String,
    pub color: String,
    pub profile_image: Option<String>,
    pub total_time: i64,
    pub laps: i32,
    pub best_lap: Option<i64>,
    pub average_lap: f64,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Driver {
    /************ INSERTERS ************/
    /// # create a new driver
    pub fn new(conn: &mut PgConnection, config: DriverConfig, now: NaiveDateTime) -> CustomResult<Driver> {
        let new_driver = NewDriver {
            name: config.name,
            color: config.color,
            profile_image: config.profile_image,
            created_at: now,
            updated_at: now,
        };

        let driver: Driver = diesel::insert_into(drivers::table)
            .values(&new_driver)
            .get_result(conn)?;

        Ok(driver)
    }

    /************ GETTERS ************/
    /// # get a driver by its id
    pub fn get_by_id(conn: &mut PgConnection, id_in: i32) -> CustomResult<Driver> {
        use crate::schema::drivers::dsl::*;

        drivers
            .filter(id.eq(id_in))
            .first::<Driver>(conn)
            .optional()?
            .ok_or_else(|| DriverNotFoundSnafu { id: id_in }.build())
    }

    /// # get all active drivers
    /// soft-deleted drivers stay out of every roster listing.
    pub fn get_all_active(conn: &mut PgConnection) -> CustomResult<Vec<Driver>> {
        use crate::schema::drivers::dsl::*;

        let all = drivers
            .filter(is_active.eq(true))
            .order(name.asc())
            .load::<Driver>(conn)?;
        Ok(all)
    }

    /************ AGGREGATES ************/
    /// # fold one recorded lap into the cumulative stats
    pub fn apply_lap(&mut self, lap_time: i64, now: NaiveDateTime) {
        self.laps += 1;
        self.total_time += lap_time;
        self.best_lap = Some(match self.best_lap {
            Some(best) => best.min(lap_time),
            None => lap_time,
        });
        self.recalculate_average();
        self.updated_at = now;
    }

    /// # take one recorded lap back out of the cumulative stats
    /// `remaining_best` is the best lap over the laps that survive the
    /// rollback; it cannot be derived incrementally.
    pub fn rollback_lap(
        &mut self,
        lap_time: i64,
        remaining_best: Option<i64>,
        now: NaiveDateTime,
    ) -> CustomResult<()> {
        if self.laps < 1 || self.total_time < lap_time {
            return InconsistentStateSnafu {
                details: format!(
                    "rolling back a {}ms lap would leave driver {} with negative totals",
                    lap_time, self.id
                ),
            }
            .fail();
        }

        self.laps -= 1;
        self.total_time -= lap_time;
        self.best_lap = remaining_best;
        self.recalculate_average();
        self.updated_at = now;
        Ok(())
    }

    /// # shift the total time by an amendment delta
    /// best lap is handed in recomputed from the full history, a lowered or
    /// raised time invalidates any incremental knowledge of it.
    pub fn amend_lap_time(
        &mut self,
        old_lap_time: i64,
        new_lap_time: i64,
        recomputed_best: Option<i64>,
        now: NaiveDateTime,
    ) -> CustomResult<()> {
        let new_total = self.total_time - old_lap_time + new_lap_time;
        if new_total < 0 {
            return InconsistentStateSnafu {
                details: format!(
                    "amending a lap from {}ms to {}ms would leave driver {} with negative totals",
                    old_lap_time, new_lap_time, self.id
                ),
            }
            .fail();
        }

        self.total_time = new_total;
        self.best_lap = recomputed_best;
        self.recalculate_average();
        self.updated_at = now;
        Ok(())
    }

    /// # rebuild the cumulative stats from a full lap history
    /// the canonical repair path; always safe to rerun.
    pub fn recompute_from(&mut self, laps: &[Lap], now: NaiveDateTime) {
        self.laps = laps.len() as i32;
        self.total_time = laps.iter().map(|lap| lap.lap_time).sum();
        self.best_lap = laps.iter().map(|lap| lap.lap_time).min();
        self.recalculate_average();
        self.updated_at = now;
    }

    fn recalculate_average(&mut self) {
        if self.laps > 0 {
            self.average_lap = self.total_time as f64 / self.laps as f64;
        } else {
            self.average_lap = 0.0;
        }
    }

    /// # rebuild a driver's stats from the database and persist them
    pub fn recompute_aggregates(
        conn: &mut PgConnection,
        driver_id: i32,
        now: NaiveDateTime,
    ) -> CustomResult<Driver> {
        let mut driver = Driver::get_by_id(conn, driver_id)?;
        let laps = Lap::from_driver(conn, driver_id, None)?;

        driver.recompute_from(&laps, now);
        let driver = driver.persist(conn)?;

        driver.clear_cache_async();
        Ok(driver)
    }

    /************ UPDATERS ************/
    /// # persist the in-memory state of this driver
    pub fn persist(&self, conn: &mut PgConnection) -> CustomResult<Driver> {
        use crate::schema::drivers::dsl::*;

        let updated = diesel::update(drivers.filter(id.eq(self.id)))
            .set(self)
            .get_result::<Driver>(conn)?;
        Ok(updated)
    }

    /// # apply an update request
    pub fn apply_update(&mut self, update: &DriverUpdate, now: NaiveDateTime) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(color) = &update.color {
            self.color = color.clone();
        }
        if let Some(profile_image) = &update.profile_image {
            self.profile_image = Some(profile_image.clone());
        }
        self.updated_at = now;
    }

    /// # zero out the cumulative stats
    pub fn reset_stats(&mut self, now: NaiveDateTime) {
        self.total_time = 0;
        self.laps = 0;
        self.best_lap = None;
        self.average_lap = 0.0;
        self.updated_at = now;
    }

    /************ DELETERS ************/
    /// # soft-delete this driver
    /// the row stays, historical laps keep their denormalized name.
    pub fn soft_delete(&mut self, conn: &mut PgConnection, now: NaiveDateTime) -> CustomResult<Driver> {
        self.is_active = false;
        self.updated_at = now;
        let driver = self.persist(conn)?;

        driver.clear_cache_async();
        Ok(driver)
    }

    /************ UTILS ************/
    /// # order drivers the leaderboard way
    /// ascending total time; drivers who did more laps in the same time
    /// rank higher.
    pub fn rank_leaderboard(mut drivers_in: Vec<Driver>) -> Vec<Driver> {
        drivers_in.sort_by(|a, b| {
            a.total_time
                .cmp(&b.total_time)
                .then(b.laps.cmp(&a.laps))
        });
        drivers_in
    }

    /// # get the leaderboard
    pub fn leaderboard(conn: &mut PgConnection, limit: i64) -> CustomResult<Vec<LeaderboardEntry>> {
        use crate::schema::drivers::dsl::*;

        let ranked = drivers
            .filter(is_active.eq(true))
            .order((total_time.asc(), laps.desc()))
            .limit(limit)
            .load::<Driver>(conn)?;

        let entries = ranked
            .into_iter()
            .enumerate()
            .map(|(index, driver)| LeaderboardEntry {
                rank: index + 1,
                driver: LeaderboardDriver {
                    id: driver.id,
                    name: driver.name,
                    color: driver.color,
                },
                stats: LeaderboardStats {
                    total_time: driver.total_time,
                    laps: driver.laps,
                    best_lap: driver.best_lap,
                    average_lap: driver.average_lap,
                },
            })
            .collect();

        Ok(entries)
    }

    /// # get the stats of a driver
    /// derived from the lap history, not the cached aggregates.
    pub fn get_stats(&self, conn: &mut PgConnection) -> CustomResult<DriverStats> {
        let laps = Lap::from_driver(conn, self.id, None)?;

        let race_count = laps.iter().map(|lap| lap.race).collect::<HashSet<i32>>().len();
        let total_time: i64 = laps.iter().map(|lap| lap.lap_time).sum();
        let average = if laps.is_empty() {
            0.0
        } else {
            total_time as f64 / laps.len() as f64
        };

        Ok(DriverStats {
            driver: self.clone(),
            total_laps: laps.len(),
            total_races: race_count,
            average_lap_time: average,
            best_lap: laps.iter().map(|lap| lap.lap_time).min(),
            recent_laps: laps.into_iter().take(10).collect(),
        })
    }

    /// # recompute every active driver's stats from the lap history
    /// returns them in leaderboard order; nothing is persisted.
    pub fn calculated_stats(conn: &mut PgConnection, now: NaiveDateTime) -> CustomResult<Vec<Driver>> {
        let mut all = Driver::get_all_active(conn)?;

        for driver in all.iter_mut() {
            let laps = Lap::from_driver(conn, driver.id, None)?;
            driver.recompute_from(&laps, now);
        }

        Ok(Driver::rank_leaderboard(all))
    }

    pub fn clear_cache(&self, r_conn: &mut redis::Connection) {
        let keys = vec![
            format!("/api/drivers/{}/stats", self.id),
            "/api/drivers/leaderboard/overall".to_string(),
            "/api/drivers/stats/calculated".to_string(),
            "/api/laps/best/overall".to_string(),
        ];

        delete_keys!(r_conn, keys, "models/driver:clear_cache");
    }

    pub fn clear_cache_async(&self) {
        let driver = self.clone();
        thread::spawn(move || {
            clear_cache!(driver, "models/driver:clear_cache");
        });
    }
}

/// # Stats of a driver derived from the lap history
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverStats {
    pub driver: Driver,
    pub total_laps: usize,
    pub total_races: usize,
    pub average_lap_time: f64,
    pub best_lap: Option<i64>,
    pub recent_laps: Vec<Lap>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub driver: LeaderboardDriver,
    pub stats: LeaderboardStats,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardDriver {
    pub id: i32,
    pub name: String,
    pub color: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardStats {
    pub total_time: i64,
    pub laps: i32,
    pub best_lap: Option<i64>,
    pub average_lap: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use chrono::NaiveDate;

    fn at(secs: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(14, 0, secs)
            .unwrap()
    }

    fn fresh_driver(id: i32, name: &str) -> Driver {
        Driver {
            id,
            name: name.to_string(),
            color: "#1f2937".to_string(),
            profile_image: None,
            total_time: 0,
            laps: 0,
            best_lap: None,
            average_lap: 0.0,
            is_active: true,
            created_at: at(0),
            updated_at: at(0),
        }
    }

    #[test]
    fn first_lap_sets_every_aggregate() {
        let mut driver = fresh_driver(1, "Alice");

        driver.apply_lap(120_000, at(1));

        assert_eq!(driver.laps, 1);
        assert_eq!(driver.total_time, 120_000);
        assert_eq!(driver.best_lap, Some(120_000));
        assert_eq!(driver.average_lap, 120_000.0);
    }

    #[test]
    fn faster_second_lap_lowers_best_and_average() {
        let mut driver = fresh_driver(1, "Alice");
        driver.apply_lap(120_000, at(1));

        driver.apply_lap(90_000, at(2));

        assert_eq!(driver.laps, 2);
        assert_eq!(driver.total_time, 210_000);
        assert_eq!(driver.best_lap, Some(90_000));
        assert_eq!(driver.average_lap, 105_000.0);
    }

    #[test]
    fn rollback_restores_the_previous_aggregates() {
        let mut driver = fresh_driver(1, "Alice");
        driver.apply_lap(120_000, at(1));
        driver.apply_lap(90_000, at(2));

        driver.rollback_lap(120_000, Some(90_000), at(3)).unwrap();

        assert_eq!(driver.laps, 1);
        assert_eq!(driver.total_time, 90_000);
        assert_eq!(driver.best_lap, Some(90_000));
        assert_eq!(driver.average_lap, 90_000.0);
    }

    #[test]
    fn rollback_of_the_only_lap_clears_best() {
        let mut driver = fresh_driver(1, "Alice");
        driver.apply_lap(120_000, at(1));

        driver.rollback_lap(120_000, None, at(2)).unwrap();

        assert_eq!(driver.laps, 0);
        assert_eq!(driver.total_time, 0);
        assert_eq!(driver.best_lap, None);
        assert_eq!(driver.average_lap, 0.0);
    }

    #[test]
    fn rollback_below_zero_is_an_integrity_fault() {
        let mut driver = fresh_driver(1, "Alice");
        driver.apply_lap(90_000, at(1));

        let error = driver.rollback_lap(120_000, None, at(2)).unwrap_err();
        assert!(matches!(error, Error::InconsistentStateError { .. }));
        // nothing was mutated
        assert_eq!(driver.laps, 1);
        assert_eq!(driver.total_time, 90_000);
    }

    #[test]
    fn average_always_reconciles_with_totals() {
        let mut driver = fresh_driver(1, "Alice");
        for lap_time in [95_000, 88_000, 102_000, 91_000] {
            driver.apply_lap(lap_time, at(1));
            assert_eq!(
                driver.average_lap,
                driver.total_time as f64 / driver.laps as f64
            );
        }
    }

    #[test]
    fn recompute_matches_incremental_bookkeeping() {
        let mut incremental = fresh_driver(1, "Alice");
        incremental.apply_lap(95_000, at(1));
        incremental.apply_lap(88_000, at(2));

        // recompute is exercised with the driver's own laps elsewhere;
        // here the pure fold is checked against the incremental path.
        let mut recomputed = fresh_driver(1, "Alice");
        recomputed.laps = 2;
        recomputed.total_time = 95_000 + 88_000;
        recomputed.best_lap = Some(88_000);
        recomputed.recalculate_average();

        assert_eq!(incremental.laps, recomputed.laps);
        assert_eq!(incremental.total_time, recomputed.total_time);
        assert_eq!(incremental.best_lap, recomputed.best_lap);
        assert_eq!(incremental.average_lap, recomputed.average_lap);
    }

    #[test]
    fn leaderboard_ranks_more_laps_first_on_equal_time() {
        let mut a = fresh_driver(1, "Alice");
        let mut b = fresh_driver(2, "Bob");
        let mut c = fresh_driver(3, "Carol");

        a.apply_lap(100_000, at(1));
        a.apply_lap(100_000, at(2));
        b.apply_lap(200_000, at(1));
        c.apply_lap(150_000, at(1));

        let ranked = Driver::rank_leaderboard(vec![b.clone(), c.clone(), a.clone()]);

        // same 200s total: Alice did two laps, Bob one
        assert_eq!(ranked[0].id, c.id);
        assert_eq!(ranked[1].id, a.id);
        assert_eq!(ranked[2].id, b.id);
    }

    #[test]
    fn ranking_twice_yields_the_same_order() {
        let mut a = fresh_driver(1, "Alice");
        let mut b = fresh_driver(2, "Bob");
        a.apply_lap(100_000, at(1));
        b.apply_lap(90_000, at(1));

        let once = Driver::rank_leaderboard(vec![a.clone(), b.clone()]);
        let twice = Driver::rank_leaderboard(once.clone());

        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_name_strips_query_characters() {
        assert_eq!(sanitize_name("Alice"), "Alice");
        assert_eq!(sanitize_name("  Jean-Luc "), "Jean-Luc");
        assert_eq!(sanitize_name("Robert'); DROP TABLE drivers;--"), "Robert' DROP TABLE drivers--");
    }
}
