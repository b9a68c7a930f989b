use std::collections::HashMap;
use std::thread;

use chrono::NaiveDateTime;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use log::error;
use serde::{Deserialize, Serialize};

use crate::errors::{
    CustomResult, Error, InconsistentStateSnafu, InvalidDurationSnafu, LapNotFoundSnafu,
    RaceNotRunningSnafu,
};
use crate::models::NewLap;
use crate::modules::helpers::math::Math;
use crate::modules::models::driver::Driver;
use crate::modules::models::race::{Race, RaceStatus};
use crate::modules::redis::Redis;
use crate::schema::laps;

/// A completed stint: one continuous driving turn by a single driver,
/// recorded once and never mutated outside the explicit correction path.
/// The driver name is denormalized so renaming or retiring a driver never
/// rewrites history.
#[derive(Queryable, Identifiable, Associations, Serialize, Deserialize, PartialEq, Debug, Clone)]
#[diesel(belongs_to(Race, foreign_key = race))]
#[diesel(belongs_to(Driver, foreign_key = driver))]
#[diesel(table_name = laps)]
#[serde(rename_all = "camelCase")]
pub struct Lap {
    pub id: i32,
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

/// Fields accepted by the plain lap creation endpoint. Numbering and
/// cumulative totals are always assigned server side.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LapCreate {
    pub race: i32,
    pub driver: i32,
    pub stint_start_time: NaiveDateTime,
    pub stint_end_time: NaiveDateTime,
    #[serde(default)]
    pub notes: String,
}

impl Lap {
    /************ RECORDER ************/
    /// # record a completed stint
    /// the validated write path: checks the race is running and a stint is
    /// open, assigns the next lap number and cumulative total, then updates
    /// the driver and race aggregates. everything happens in one
    /// transaction with the race row locked, so two actors racing to end
    /// the same stint serialize and the loser fails on the cleared stint
    /// instead of double-recording.
    ///
    /// the open stint is closed on success; reopening is an explicit
    /// follow-up (`change_driver` or `start`), never inferred here.
    pub fn record_stint(
        conn: &mut PgConnection,
        race_id: i32,
        driver_id: i32,
        stint_start: Option<NaiveDateTime>,
        stint_end: NaiveDateTime,
        notes: String,
    ) -> CustomResult<Lap> {
        let lap = conn.transaction::<Lap, Error, _>(|conn| {
            let mut race = Race::lock_by_id(conn, race_id)?;
            Lap::ensure_recordable(&race)?;

            let mut driver = Driver::get_by_id(conn, driver_id)?;

            let open_stint = match race.current_stint_start {
                Some(open_stint) => open_stint,
                None => {
                    return Err(Error::ValidationError {
                        details: "no open stint to record for this race".to_string(),
                    })
                }
            };
            let stint_start = stint_start.unwrap_or(open_stint);

            let lap_time = (stint_end - stint_start).num_milliseconds();
            if lap_time <= 0 {
                return InvalidDurationSnafu { millis: lap_time }.fail();
            }

            let new_lap = NewLap {
                race: race.id,
                driver: driver.id,
                driver_name: driver.name.clone(),
                lap_number: race.total_laps + 1,
                lap_time,
                total_time: race.total_time + lap_time,
                stint_start_time: stint_start,
                stint_end_time: stint_end,
                notes,
                created_at: stint_end,
            };

            let lap: Lap = diesel::insert_into(laps::table)
                .values(&new_lap)
                .get_result(conn)?;

            driver.apply_lap(lap_time, stint_end);
            driver.persist(conn)?;

            race.total_laps += 1;
            race.total_time += lap_time;
            race.current_stint_start = None;
            race.updated_at = stint_end;
            race.persist(conn)?;

            Ok(lap)
        })?;

        Lap::clear_related_caches(lap.race, lap.driver, conn);
        Ok(lap)
    }

    /// # insert a lap directly
    /// administrative path without the running-race and open-stint checks,
    /// for importing or backfilling. aggregates are updated the same way.
    pub fn create(conn: &mut PgConnection, data: LapCreate, now: NaiveDateTime) -> CustomResult<Lap> {
        let lap = conn.transaction::<Lap, Error, _>(|conn| {
            let mut race = Race::lock_by_id(conn, data.race)?;
            let mut driver = Driver::get_by_id(conn, data.driver)?;

            let lap_time = (data.stint_end_time - data.stint_start_time).num_milliseconds();
            if lap_time <= 0 {
                return InvalidDurationSnafu { millis: lap_time }.fail();
            }

            let new_lap = NewLap {
                race: race.id,
                driver: driver.id,
                driver_name: driver.name.clone(),
                lap_number: race.total_laps + 1,
                lap_time,
                total_time: race.total_time + lap_time,
                stint_start_time: data.stint_start_time,
                stint_end_time: data.stint_end_time,
                notes: data.notes,
                created_at: now,
            };

            let lap: Lap = diesel::insert_into(laps::table)
                .values(&new_lap)
                .get_result(conn)?;

            driver.apply_lap(lap_time, now);
            driver.persist(conn)?;

            race.total_laps += 1;
            race.total_time += lap_time;
            race.updated_at = now;
            race.persist(conn)?;

            Ok(lap)
        })?;

        Lap::clear_related_caches(lap.race, lap.driver, conn);
        Ok(lap)
    }

    /// # amend a recorded lap time
    /// shifts the owning driver's total by the delta and rescans their full
    /// history for the best lap; the race's cumulative totals are rebased
    /// so later laps keep a non-decreasing running total.
    pub fn amend_stint(
        conn: &mut PgConnection,
        lap_id: i32,
        new_lap_time: i64,
        new_notes: Option<String>,
        now: NaiveDateTime,
    ) -> CustomResult<Lap> {
        let lap = conn.transaction::<Lap, Error, _>(|conn| {
            let lap = Lap::from_id(conn, lap_id)?;
            let mut race = Race::lock_by_id(conn, lap.race)?;

            if new_lap_time <= 0 {
                return InvalidDurationSnafu { millis: new_lap_time }.fail();
            }

            {
                use crate::schema::laps::dsl::*;
                diesel::update(laps.filter(id.eq(lap_id)))
                    .set((
                        lap_time.eq(new_lap_time),
                        notes.eq(new_notes.unwrap_or(lap.notes)),
                    ))
                    .execute(conn)?;
            }

            if new_lap_time != lap.lap_time {
                let mut driver = Driver::get_by_id(conn, lap.driver)?;
                let history = Lap::from_driver(conn, lap.driver, None)?;
                let best = history.iter().map(|l| l.lap_time).min();
                driver.amend_lap_time(lap.lap_time, new_lap_time, best, now)?;
                driver.persist(conn)?;
            }

            let (count, total) = Lap::rebase_race(conn, race.id)?;
            race.total_laps = count;
            race.total_time = total;
            race.updated_at = now;
            race.persist(conn)?;

            Lap::from_id(conn, lap_id)
        })?;

        Lap::clear_related_caches(lap.race, lap.driver, conn);
        Ok(lap)
    }

    /// # delete a recorded lap
    /// rolls the driver and race aggregates back and renumbers the
    /// remaining laps of the race so numbering stays gapless.
    pub fn delete_stint(conn: &mut PgConnection, lap_id: i32, now: NaiveDateTime) -> CustomResult<()> {
        let (race_id, driver_id) = conn.transaction::<(i32, i32), Error, _>(|conn| {
            let lap = Lap::from_id(conn, lap_id)?;
            let mut race = Race::lock_by_id(conn, lap.race)?;

            if race.total_laps < 1 || race.total_time < lap.lap_time {
                return InconsistentStateSnafu {
                    details: format!(
                        "deleting lap {} would leave race {} with negative totals",
                        lap_id, race.id
                    ),
                }
                .fail();
            }

            {
                use crate::schema::laps::dsl::*;
                diesel::delete(laps.filter(id.eq(lap_id))).execute(conn)?;
            }

            let mut driver = Driver::get_by_id(conn, lap.driver)?;
            let remaining = Lap::from_driver(conn, lap.driver, None)?;
            let best = remaining.iter().map(|l| l.lap_time).min();
            driver.rollback_lap(lap.lap_time, best, now)?;
            driver.persist(conn)?;

            let (count, total) = Lap::rebase_race(conn, race.id)?;
            race.total_laps = count;
            race.total_time = total;
            race.updated_at = now;
            race.persist(conn)?;

            Ok((lap.race, lap.driver))
        })?;

        Lap::clear_related_caches(race_id, driver_id, conn);
        Ok(())
    }

    /// a stint can only be recorded against a running race; pending,
    /// paused and finished races reject the write outright.
    fn ensure_recordable(race: &Race) -> CustomResult<()> {
        if race.status != RaceStatus::Running {
            return RaceNotRunningSnafu { status: race.status }.fail();
        }
        Ok(())
    }

    /// # renumber a race's laps and rebuild their cumulative totals
    /// walks the laps in recorded order, reassigns 1-based gapless numbers
    /// and the non-decreasing running total, and returns the final
    /// `(count, total)` pair for the race row.
    fn rebase_race(conn: &mut PgConnection, race_id: i32) -> CustomResult<(i32, i64)> {
        use crate::schema::laps::dsl::*;

        let race_laps = laps
            .filter(race.eq(race_id))
            .order(lap_number.asc())
            .load::<Lap>(conn)?;

        let mut running_total: i64 = 0;
        for (index, lap) in race_laps.iter().enumerate() {
            let number = (index + 1) as i32;
            running_total += lap.lap_time;

            if lap.lap_number != number || lap.total_time != running_total {
                diesel::update(laps.filter(id.eq(lap.id)))
                    .set((lap_number.eq(number), total_time.eq(running_total)))
                    .execute(conn)?;
            }
        }

        Ok((race_laps.len() as i32, running_total))
    }

    /************ GETTERS ************/
    /// # get a lap by its id
    pub fn from_id(conn: &mut PgConnection, id_in: i32) -> CustomResult<Lap> {
        use crate::schema::laps::dsl::*;

        laps.filter(id.eq(id_in))
            .first::<Lap>(conn)
            .optional()?
            .ok_or_else(|| LapNotFoundSnafu { id: id_in }.build())
    }

    /// # get all laps of a race
    /// in recorded order.
    pub fn from_race(conn: &mut PgConnection, race_id: i32) -> CustomResult<Vec<Lap>> {
        use crate::schema::laps::dsl::*;

        let race_laps = laps
            .filter(race.eq(race_id))
            .order(lap_number.asc())
            .load::<Lap>(conn)?;
        Ok(race_laps)
    }

    /// # get the laps of a driver
    /// newest first, optionally limited.
    pub fn from_driver(
        conn: &mut PgConnection,
        driver_id: i32,
        limit: Option<i64>,
    ) -> CustomResult<Vec<Lap>> {
        use crate::schema::laps::dsl::*;

        let mut query = laps
            .filter(driver.eq(driver_id))
            .order(created_at.desc())
            .into_boxed();
        if let Some(limit_in) = limit {
            query = query.limit(limit_in);
        }

        let driver_laps = query.load::<Lap>(conn)?;
        Ok(driver_laps)
    }

    /// # get laps filtered by race and/or driver
    /// newest first, the general listing query.
    pub fn get_filtered(
        conn: &mut PgConnection,
        race_in: Option<i32>,
        driver_in: Option<i32>,
        limit_in: i64,
    ) -> CustomResult<Vec<Lap>> {
        use crate::schema::laps::dsl::*;

        let mut query = laps.order(created_at.desc()).into_boxed();
        if let Some(race_id) = race_in {
            query = query.filter(race.eq(race_id));
        }
        if let Some(driver_id) = driver_in {
            query = query.filter(driver.eq(driver_id));
        }

        let found = query.limit(limit_in).load::<Lap>(conn)?;
        Ok(found)
    }

    /// # get the fastest laps overall
    pub fn best_overall(conn: &mut PgConnection, limit_in: i64) -> CustomResult<Vec<Lap>> {
        use crate::schema::laps::dsl::*;

        let best = laps
            .order(lap_time.asc())
            .limit(limit_in)
            .load::<Lap>(conn)?;
        Ok(best)
    }

    /// # get the fastest laps of a race
    pub fn best_of_race(conn: &mut PgConnection, race_id: i32, limit_in: i64) -> CustomResult<Vec<Lap>> {
        use crate::schema::laps::dsl::*;

        let best = laps
            .filter(race.eq(race_id))
            .order(lap_time.asc())
            .limit(limit_in)
            .load::<Lap>(conn)?;
        Ok(best)
    }

    /************ UTILS ************/
    /// # group laps by driver and fold each group's stats
    /// pure and idempotent: the same lap set always folds to the same map.
    /// lap times within a group are ordered by lap number.
    pub fn aggregate_by_driver(laps_in: &[Lap]) -> HashMap<i32, DriverLapStats> {
        let mut groups: HashMap<i32, Vec<&Lap>> = HashMap::new();
        for lap in laps_in {
            groups.entry(lap.driver).or_default().push(lap);
        }

        groups
            .into_iter()
            .map(|(driver_id, mut group)| {
                group.sort_by_key(|lap| lap.lap_number);

                let total_time: i64 = group.iter().map(|lap| lap.lap_time).sum();
                let laps_count = group.len();
                let average_lap = if laps_count > 0 {
                    total_time as f64 / laps_count as f64
                } else {
                    0.0
                };

                (
                    driver_id,
                    DriverLapStats {
                        laps_count,
                        total_time,
                        best_lap: group.iter().map(|lap| lap.lap_time).min(),
                        average_lap,
                        lap_times: group.iter().map(|lap| lap.lap_time).collect(),
                    },
                )
            })
            .collect()
    }

    /// # get the stats of a lap collection
    /// "no laps yet" is a normal state, not an error: the fold yields
    /// zeroes and a null best lap on an empty set.
    pub fn stats_of(laps_in: &[Lap]) -> LapsStats {
        let lap_times: Vec<f64> = laps_in.iter().map(|lap| lap.lap_time as f64).collect();

        LapsStats {
            avg_lap_time: Math::mean(&lap_times),
            median_lap_time: Math::median(lap_times),
            fastest_lap_time: laps_in.iter().map(|lap| lap.lap_time).min(),
        }
    }

    fn clear_related_caches(race_id: i32, driver_id: i32, conn: &mut PgConnection) {
        let race = Race::get_by_id(conn, race_id);
        let driver = Driver::get_by_id(conn, driver_id);

        thread::spawn(move || {
            let r_conn = &mut match Redis::connect() {
                Ok(r_conn) => r_conn,
                Err(error) => {
                    error!(target:"models/lap:clear_related_caches", "Error connecting to redis: {}", error);
                    return;
                }
            };

            if let Ok(race) = race {
                race.clear_cache(r_conn);
            }
            if let Ok(driver) = driver {
                driver.clear_cache(r_conn);
            }
        });
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriverLapStats {
    pub laps_count: usize,
    pub total_time: i64,
    pub best_lap: Option<i64>,
    pub average_lap: f64,
    pub lap_times: Vec<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LapsStats {
    pub avg_lap_time: f64,
    pub median_lap_time: f64,
    pub fastest_lap_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(secs: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(secs as i64)
    }

    fn lap(id: i32, driver: i32, lap_number: i32, lap_time: i64, total_time: i64) -> Lap {
        Lap {
            id,
            race: 1,
            driver,
            driver_name: format!("driver {}", driver),
            lap_number,
            lap_time,
            total_time,
            stint_start_time: at(0),
            stint_end_time: at(60),
            notes: String::new(),
            created_at: at(60),
        }
    }

    #[test]
    fn aggregate_of_no_laps_is_empty() {
        assert!(Lap::aggregate_by_driver(&[]).is_empty());
    }

    #[test]
    fn aggregate_groups_by_driver() {
        let laps = vec![
            lap(1, 1, 1, 120_000, 120_000),
            lap(2, 2, 2, 110_000, 230_000),
            lap(3, 1, 3, 90_000, 320_000),
        ];

        let stats = Lap::aggregate_by_driver(&laps);

        let alice = &stats[&1];
        assert_eq!(alice.laps_count, 2);
        assert_eq!(alice.total_time, 210_000);
        assert_eq!(alice.best_lap, Some(90_000));
        assert_eq!(alice.average_lap, 105_000.0);
        assert_eq!(alice.lap_times, vec![120_000, 90_000]);

        let bob = &stats[&2];
        assert_eq!(bob.laps_count, 1);
        assert_eq!(bob.best_lap, Some(110_000));
    }

    #[test]
    fn aggregate_orders_lap_times_by_lap_number() {
        // deliberately shuffled input
        let laps = vec![
            lap(3, 1, 3, 90_000, 320_000),
            lap(1, 1, 1, 120_000, 120_000),
            lap(2, 1, 2, 110_000, 230_000),
        ];

        let stats = Lap::aggregate_by_driver(&laps);
        assert_eq!(stats[&1].lap_times, vec![120_000, 110_000, 90_000]);
    }

    #[test]
    fn aggregate_twice_yields_identical_results() {
        let laps = vec![
            lap(1, 1, 1, 120_000, 120_000),
            lap(2, 2, 2, 110_000, 230_000),
            lap(3, 1, 3, 90_000, 320_000),
        ];

        assert_eq!(Lap::aggregate_by_driver(&laps), Lap::aggregate_by_driver(&laps));
    }

    #[test]
    fn stats_of_no_laps_is_all_zeroes() {
        let stats = Lap::stats_of(&[]);

        assert_eq!(stats.avg_lap_time, 0.0);
        assert_eq!(stats.median_lap_time, 0.0);
        assert_eq!(stats.fastest_lap_time, None);
    }

    #[test]
    fn stats_of_folds_the_collection() {
        let laps = vec![
            lap(1, 1, 1, 120_000, 120_000),
            lap(2, 2, 2, 110_000, 230_000),
            lap(3, 1, 3, 90_000, 320_000),
        ];

        let stats = Lap::stats_of(&laps);

        assert_eq!(stats.fastest_lap_time, Some(90_000));
        assert_eq!(stats.median_lap_time, 110_000.0);
        assert!((stats.avg_lap_time - 106_666.666).abs() < 1.0);
    }

    #[test]
    fn recording_requires_a_running_race() {
        let mut race = Race {
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
        };

        for status in [RaceStatus::Pending, RaceStatus::Paused, RaceStatus::Finished] {
            race.status = status;
            let error = Lap::ensure_recordable(&race).unwrap_err();
            assert!(matches!(error, Error::RaceNotRunningError { .. }));
        }

        race.status = RaceStatus::Running;
        assert!(Lap::ensure_recordable(&race).is_ok());
    }

    #[test]
    fn recorded_laps_carry_monotonic_numbering_and_totals() {
        // the shape record_stint persists: gapless 1-based numbers and a
        // non-decreasing running total
        let laps = vec![
            lap(1, 1, 1, 120_000, 120_000),
            lap(2, 2, 2, 110_000, 230_000),
            lap(3, 1, 3, 90_000, 320_000),
        ];

        for window in laps.windows(2) {
            assert_eq!(window[1].lap_number, window[0].lap_number + 1);
            assert!(window[1].total_time >= window[0].total_time);
        }
        assert_eq!(
            laps.last().unwrap().total_time,
            laps.iter().map(|l| l.lap_time).sum::<i64>()
        );
    }
}
