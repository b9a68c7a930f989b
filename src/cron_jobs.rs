use std::collections::HashSet;
use std::time::Duration;

use log::{info, warn};
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::modules::models::general::establish_connection;
use crate::modules::models::race::{Race, RaceStatus};
use crate::modules::weather_api;

/// refresh the cached weather for every city with a running race.
/// dashboards read the cache, so a dead weather api never slows them down.
pub async fn refresh_weather_cache() {
    let cities: Vec<String> = {
        let conn = &mut establish_connection();
        match Race::get_all(conn) {
            Ok(races) => races
                .into_iter()
                .filter(|race| race.status == RaceStatus::Running)
                .map(|race| race.city)
                .collect::<HashSet<String>>()
                .into_iter()
                .collect(),
            Err(error) => {
                warn!(target:"cron/weather", "failed loading races: {}", error);
                return;
            }
        }
    };

    for city in cities {
        match weather_api::get_current_weather(&city).await {
            Ok(weather) => {
                weather_api::write_weather_cache(&city, &weather);
                info!(target:"cron/weather", "refreshed weather for {}", city);
            }
            Err(error) => {
                warn!(target:"cron/weather", "failed refreshing weather for {}: {}", city, error);
            }
        }
    }
}

pub async fn register_cron_jobs() {
    let scheduler = JobScheduler::new().await.unwrap();

    // run every 15 minutes
    let j = Job::new_repeated_async(
        Duration::from_secs(900),
        |_uuid, _l| {
            Box::pin(async {
                refresh_weather_cache().await;
            })
        },
    ).unwrap();
    scheduler.add(j).await.unwrap();
    scheduler.start().await.unwrap();
}
