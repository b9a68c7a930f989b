use std::fmt;
use std::str::FromStr;
use std::thread;

use chrono::NaiveDateTime;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use log::error;
use serde::{Deserialize, Serialize};

use crate::errors::{CustomResult, Error, InvalidTransitionSnafu, RaceNotFoundSnafu};
use crate::macros::redis::{clear_cache, delete_keys};
use crate::models::NewRace;
use crate::modules::models::lap::Lap;
use crate::modules::redis::Redis;
use crate::schema::races;

/// Lifecycle of a race. `Finished` is terminal, the only way out of it
/// is deleting the race altogether.
#[derive(
    AsExpression, FromSqlRow, Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Hash,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum RaceStatus {
    Pending,
    Running,
    Paused,
    Finished,
}

impl RaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceStatus::Pending => "pending",
            RaceStatus::Running => "running",
            RaceStatus::Paused => "paused",
            RaceStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for RaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RaceStatus {
    type Err = Error;

    fn from_str(value: &str) -> CustomResult<RaceStatus> {
        match value {
            "pending" => Ok(RaceStatus::Pending),
            "running" => Ok(RaceStatus::Running),
            "paused" => Ok(RaceStatus::Paused),
            "finished" => Ok(RaceStatus::Finished),
            other => Err(Error::ValidationError {
                details: format!("unknown race status: {}", other),
            }),
        }
    }
}

impl ToSql<Text, Pg> for RaceStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<Text, Pg> for RaceStatus {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        let value = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        RaceStatus::from_str(&value).map_err(|error| error.to_string().into())
    }
}

/// Partial settings update, merged field by field. Never touches the
/// race status.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RaceSettingsUpdate {
    pub min_stint_time: Option<i32>,
    pub max_stint_time: Option<i32>,
    pub target_laps: Option<i32>,
    pub city: Option<String>,
}

/// Initial values for a new race. Defaults mirror the usual endurance
/// session setup.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct RaceConfig {
    pub name: String,
    pub team_name: String,
    pub duration: i32,
    pub min_stint_time: i32,
    pub max_stint_time: i32,
    pub target_laps: i32,
    pub city: String,
}

impl Default for RaceConfig {
    fn default() -> RaceConfig {
        RaceConfig {
            name: "Course Karting Endurance".to_string(),
            team_name: "Endurance - Sigma Team".to_string(),
            duration: 60,
            min_stint_time: 10,
            max_stint_time: 30,
            target_laps: 0,
            city: "Paris".to_string(),
        }
    }
}

/// Fields accepted by the update endpoint. Status transitions go through
/// the dedicated operations, never through here.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RaceUpdate {
    pub name: Option<String>,
    pub team_name: Option<String>,
    pub duration: Option<i32>,
    #[serde(default)]
    pub settings: RaceSettingsUpdate,
}

#[derive(Queryable, Identifiable, AsChangeset, Serialize, Deserialize, PartialEq, Debug, Clone)]
#[diesel(table_name = races, treat_none_as_null = true)]
#[serde(rename_all = "camelCase")]
pub struct Race {
    pub id: i32,
    pub name: String,
    pub team_name: String,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub duration: i32,
    pub status: RaceStatus,
    pub min_stint_time: i32,
    pub max_stint_time: i32,
    pub target_laps: i32,
    pub city: String,
    pub total_laps: i32,
    pub total_time: i64,
    pub current_driver: Option<i32>,
    pub current_stint_start: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Race {
    /************ STATE MACHINE ************/
    /// # start the race
    /// legal from `pending` and `paused`. sets the start time on the first
    /// start only and opens a stint clock.
    ///
    /// all timestamps are injected by the caller so the transition itself
    /// stays deterministic.
    pub fn start(&mut self, now: NaiveDateTime) -> CustomResult<()> {
        match self.status {
            RaceStatus::Pending | RaceStatus::Paused => {
                self.status = RaceStatus::Running;
                if self.start_time.is_none() {
                    self.start_time = Some(now);
                }
                self.current_stint_start = Some(now);
                self.updated_at = now;
                Ok(())
            }
            from => InvalidTransitionSnafu {
                from,
                to: RaceStatus::Running,
            }
            .fail(),
        }
    }

    /// # pause the race
    /// legal from `running` only. an open stint is not implicitly ended by
    /// a pause, the stint clock keeps its start.
    pub fn pause(&mut self, now: NaiveDateTime) -> CustomResult<()> {
        match self.status {
            RaceStatus::Running => {
                self.status = RaceStatus::Paused;
                self.updated_at = now;
                Ok(())
            }
            from => InvalidTransitionSnafu {
                from,
                to: RaceStatus::Paused,
            }
            .fail(),
        }
    }

    /// # finish the race
    /// legal from `running` and `paused`. an open stint must be ended first,
    /// finishing never closes it implicitly.
    pub fn finish(&mut self, now: NaiveDateTime) -> CustomResult<()> {
        match self.status {
            RaceStatus::Running | RaceStatus::Paused => {
                if self.current_stint_start.is_some() {
                    return Err(Error::ValidationError {
                        details: "an open stint must be ended before finishing the race"
                            .to_string(),
                    });
                }

                self.status = RaceStatus::Finished;
                self.end_time = Some(now);
                self.updated_at = now;
                Ok(())
            }
            from => InvalidTransitionSnafu {
                from,
                to: RaceStatus::Finished,
            }
            .fail(),
        }
    }

    /// # change the current driver
    /// legal in any non-finished state. resets the stint clock; any open
    /// stint must have been recorded beforehand, lap boundaries are never
    /// inferred here.
    pub fn change_driver(&mut self, driver_id: i32, now: NaiveDateTime) -> CustomResult<()> {
        if self.status == RaceStatus::Finished {
            return Err(Error::ValidationError {
                details: "cannot change driver on a finished race".to_string(),
            });
        }

        self.current_driver = Some(driver_id);
        self.current_stint_start = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// # merge a partial settings update
    /// legal in any state, never touches the status.
    pub fn merge_settings(&mut self, update: &RaceSettingsUpdate, now: NaiveDateTime) {
        if let Some(min_stint_time) = update.min_stint_time {
            self.min_stint_time = min_stint_time;
        }
        if let Some(max_stint_time) = update.max_stint_time {
            self.max_stint_time = max_stint_time;
        }
        if let Some(target_laps) = update.target_laps {
            self.target_laps = target_laps;
        }
        if let Some(city) = &update.city {
            self.city = city.clone();
        }
        self.updated_at = now;
    }

    /// # apply an update request
    pub fn apply_update(&mut self, update: &RaceUpdate, now: NaiveDateTime) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(team_name) = &update.team_name {
            self.team_name = team_name.clone();
        }
        if let Some(duration) = update.duration {
            self.duration = duration;
        }
        self.merge_settings(&update.settings, now);
    }

    /************ INSERTERS ************/
    /// # create a new race
    /// the race starts out `pending` with zeroed totals.
    pub fn new(conn: &mut PgConnection, config: RaceConfig, now: NaiveDateTime) -> CustomResult<Race> {
        let new_race = NewRace {
            name: config.name,
            team_name: config.team_name,
            duration: config.duration,
            status: RaceStatus::Pending.as_str().to_string(),
            min_stint_time: config.min_stint_time,
            max_stint_time: config.max_stint_time,
            target_laps: config.target_laps,
            city: config.city,
            created_at: now,
            updated_at: now,
        };

        let race: Race = diesel::insert_into(races::table)
            .values(&new_race)
            .get_result(conn)?;

        Ok(race)
    }

    /************ GETTERS ************/
    /// # get a race by its id
    pub fn get_by_id(conn: &mut PgConnection, id_in: i32) -> CustomResult<Race> {
        use crate::schema::races::dsl::*;

        races
            .filter(id.eq(id_in))
            .first::<Race>(conn)
            .optional()?
            .ok_or_else(|| RaceNotFoundSnafu { id: id_in }.build())
    }

    /// # get a race by its id, locking the row
    /// takes a `FOR UPDATE` lock so concurrent mutations of the same race
    /// serialize. this is the per-race mutation lock the recorder relies on.
    pub fn lock_by_id(conn: &mut PgConnection, id_in: i32) -> CustomResult<Race> {
        use crate::schema::races::dsl::*;

        races
            .filter(id.eq(id_in))
            .for_update()
            .first::<Race>(conn)
            .optional()?
            .ok_or_else(|| RaceNotFoundSnafu { id: id_in }.build())
    }

    /// # get all races
    /// newest first, like the dashboard lists them.
    pub fn get_all(conn: &mut PgConnection) -> CustomResult<Vec<Race>> {
        use crate::schema::races::dsl::*;

        let all = races.order(created_at.desc()).load::<Race>(conn)?;
        Ok(all)
    }

    /************ UPDATERS ************/
    /// # persist the in-memory state of this race
    pub fn persist(&self, conn: &mut PgConnection) -> CustomResult<Race> {
        use crate::schema::races::dsl::*;

        let updated = diesel::update(races.filter(id.eq(self.id)))
            .set(self)
            .get_result::<Race>(conn)?;
        Ok(updated)
    }

    /// # abandon this race and spawn a fresh pending one
    /// legal from any non-finished state. the replacement carries over the
    /// name, team and settings; the abandoned race row stays behind with
    /// its laps for the record.
    pub fn reset(&self, conn: &mut PgConnection, now: NaiveDateTime) -> CustomResult<Race> {
        if self.status == RaceStatus::Finished {
            return InvalidTransitionSnafu {
                from: RaceStatus::Finished,
                to: RaceStatus::Pending,
            }
            .fail();
        }

        let replacement = Race::new(
            conn,
            RaceConfig {
                name: self.name.clone(),
                team_name: self.team_name.clone(),
                duration: self.duration,
                min_stint_time: self.min_stint_time,
                max_stint_time: self.max_stint_time,
                target_laps: self.target_laps,
                city: self.city.clone(),
            },
            now,
        )?;

        self.clear_cache_async();
        Ok(replacement)
    }

    /************ DELETERS ************/
    /// # delete this race
    /// deletes all of its laps first, a race exclusively owns them.
    pub fn delete(&self, conn: &mut PgConnection) -> CustomResult<()> {
        use crate::schema::laps;

        diesel::delete(laps::table.filter(laps::race.eq(self.id))).execute(conn)?;
        diesel::delete(races::table.filter(races::id.eq(self.id))).execute(conn)?;

        self.clear_cache_async();
        Ok(())
    }

    /************ UTILS ************/
    /// # get the stats of this race
    /// derived from the full lap list, not the cached totals.
    pub fn get_stats(&self, conn: &mut PgConnection) -> CustomResult<RaceStats> {
        let laps = Lap::from_race(conn, self.id)?;
        let stats = Lap::stats_of(&laps);

        Ok(RaceStats {
            race: self.clone(),
            total_laps: laps.len(),
            average_lap_time: stats.avg_lap_time,
            best_lap: stats.fastest_lap_time,
            laps,
        })
    }

    pub fn clear_cache(&self, r_conn: &mut redis::Connection) {
        let keys = vec![
            format!("/api/races/{}/stats", self.id),
            format!("/api/laps/best/race/{}", self.id),
            "/api/laps/best/overall".to_string(),
            "/api/drivers/leaderboard/overall".to_string(),
            "/api/drivers/stats/calculated".to_string(),
        ];

        delete_keys!(r_conn, keys, "models/race:clear_cache");
    }

    fn clear_cache_async(&self) {
        let race = self.clone();
        thread::spawn(move || {
            clear_cache!(race, "models/race:clear_cache");
        });
    }
}

/// # Stats of a single race derived from its laps
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RaceStats {
    pub race: Race,
    pub total_laps: usize,
    pub average_lap_time: f64,
    pub best_lap: Option<i64>,
    pub laps: Vec<Lap>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(secs: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(14, 0, secs)
            .unwrap()
    }

    fn pending_race() -> Race {
        Race {
            id: 1,
            name: "Course Karting Endurance".to_string(),
            team_name: "Endurance - Sigma Team".to_string(),
            start_time: None,
            end_time: None,
            duration: 60,
            status: RaceStatus::Pending,
            min_stint_time: 10,
            max_stint_time: 30,
            target_laps: 0,
            city: "Paris".to_string(),
            total_laps: 0,
            total_time: 0,
            current_driver: None,
            current_stint_start: None,
            created_at: at(0),
            updated_at: at(0),
        }
    }

    #[test]
    fn start_from_pending_opens_a_stint() {
        let mut race = pending_race();

        race.start(at(5)).unwrap();

        assert_eq!(race.status, RaceStatus::Running);
        assert_eq!(race.start_time, Some(at(5)));
        assert_eq!(race.current_stint_start, Some(at(5)));
    }

    #[test]
    fn start_keeps_the_original_start_time_after_a_pause() {
        let mut race = pending_race();
        race.start(at(5)).unwrap();
        race.pause(at(10)).unwrap();

        race.start(at(20)).unwrap();

        assert_eq!(race.start_time, Some(at(5)));
        assert_eq!(race.current_stint_start, Some(at(20)));
    }

    #[test]
    fn start_from_running_is_rejected() {
        let mut race = pending_race();
        race.start(at(5)).unwrap();

        let error = race.start(at(6)).unwrap_err();
        assert!(matches!(error, Error::InvalidTransitionError { .. }));
    }

    #[test]
    fn start_from_finished_is_rejected() {
        let mut race = pending_race();
        race.start(at(5)).unwrap();
        race.current_stint_start = None;
        race.finish(at(10)).unwrap();

        let error = race.start(at(11)).unwrap_err();
        assert!(matches!(error, Error::InvalidTransitionError { .. }));
    }

    #[test]
    fn pause_keeps_the_stint_clock() {
        let mut race = pending_race();
        race.start(at(5)).unwrap();

        race.pause(at(10)).unwrap();

        assert_eq!(race.status, RaceStatus::Paused);
        assert_eq!(race.current_stint_start, Some(at(5)));
    }

    #[test]
    fn pause_from_pending_is_rejected() {
        let mut race = pending_race();

        let error = race.pause(at(5)).unwrap_err();
        assert!(matches!(error, Error::InvalidTransitionError { .. }));
    }

    #[test]
    fn finish_from_pending_is_rejected() {
        let mut race = pending_race();

        let error = race.finish(at(5)).unwrap_err();
        assert!(matches!(error, Error::InvalidTransitionError { .. }));
    }

    #[test]
    fn finish_with_an_open_stint_is_rejected() {
        let mut race = pending_race();
        race.start(at(5)).unwrap();

        let error = race.finish(at(10)).unwrap_err();
        assert!(matches!(error, Error::ValidationError { .. }));
        assert_eq!(race.status, RaceStatus::Running);
    }

    #[test]
    fn finish_from_paused_sets_the_end_time() {
        let mut race = pending_race();
        race.start(at(5)).unwrap();
        race.pause(at(10)).unwrap();
        race.current_stint_start = None;

        race.finish(at(30)).unwrap();

        assert_eq!(race.status, RaceStatus::Finished);
        assert_eq!(race.end_time, Some(at(30)));
    }

    #[test]
    fn change_driver_resets_the_stint_clock() {
        let mut race = pending_race();
        race.start(at(5)).unwrap();

        race.change_driver(7, at(42)).unwrap();

        assert_eq!(race.current_driver, Some(7));
        assert_eq!(race.current_stint_start, Some(at(42)));
    }

    #[test]
    fn change_driver_on_finished_race_is_rejected() {
        let mut race = pending_race();
        race.start(at(5)).unwrap();
        race.current_stint_start = None;
        race.finish(at(10)).unwrap();

        assert!(race.change_driver(7, at(11)).is_err());
    }

    #[test]
    fn merge_settings_never_touches_the_status() {
        let mut race = pending_race();
        race.start(at(5)).unwrap();

        race.merge_settings(
            &RaceSettingsUpdate {
                min_stint_time: Some(15),
                city: Some("Lyon".to_string()),
                ..Default::default()
            },
            at(6),
        );

        assert_eq!(race.status, RaceStatus::Running);
        assert_eq!(race.min_stint_time, 15);
        assert_eq!(race.max_stint_time, 30);
        assert_eq!(race.city, "Lyon");
    }
}
