pub mod weather_api;
pub mod redis;
pub mod sync;

pub mod models {
    pub mod race;
    pub mod driver;
    pub mod lap;

    pub mod general;
}

pub mod helpers {
    pub mod math;
    pub mod logging;

    pub mod fairings {
        pub mod cors;
    }
}
