use std::sync::Arc;

use rocket::{launch, routes, Build, Rocket};

use karting_endurance::cron_jobs::register_cron_jobs;
use karting_endurance::modules::helpers::fairings::cors::CORS;
use karting_endurance::modules::helpers::logging::setup_logging;
use karting_endurance::modules::sync::hub::RaceHub;
use karting_endurance::modules::sync::socket;
use karting_endurance::routes::api;

#[launch]
async fn rocket() -> Rocket<Build> {
    setup_logging().expect("Failed to setup logging");

    // register cron jobs that need to run.
    // these keep the redis cache warm so the dashboards never wait.
    register_cron_jobs().await;

    // start the webserver
    rocket::build()
        .manage(Arc::new(RaceHub::new()))
        .attach(CORS)
        .mount(
            "/api",
            routes![
                // races
                api::race::list,
                api::race::get_one,
                api::race::create,
                api::race::update,
                api::race::delete,
                api::race::start,
                api::race::pause,
                api::race::finish,
                api::race::reset,
                api::race::change_driver,
                api::race::stats,
                // drivers
                api::driver::list,
                api::driver::get_one,
                api::driver::create,
                api::driver::update,
                api::driver::delete,
                api::driver::stats,
                api::driver::reset_stats,
                api::driver::leaderboard,
                api::driver::stats_calculated,
                // laps
                api::lap::list,
                api::lap::get_one,
                api::lap::create,
                api::lap::update,
                api::lap::delete,
                api::lap::record,
                api::lap::of_race,
                api::lap::of_driver,
                api::lap::best_overall,
                api::lap::best_of_race,
                // weather
                api::weather::current,
                api::weather::forecast,
            ],
        )
        .mount("/", routes![socket::race_events])
}
