use std::env;

use dotenvy::dotenv;
use log::{error, info};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::errors::{CustomResult, Error};
use crate::modules::redis::Redis;

const BASE_URL: &str = "https://api.openweathermap.org/data/2.5";
const CACHE_SECONDS: usize = 1800;

fn api_key() -> CustomResult<String> {
    dotenv().ok();
    env::var("OPENWEATHER_API_KEY").map_err(|_| Error::ValidationError {
        details: "OPENWEATHER_API_KEY is not configured".to_string(),
    })
}

fn request_url(endpoint: &str, city: &str, key: &str) -> CustomResult<Url> {
    Url::parse_with_params(
        &format!("{}/{}", BASE_URL, endpoint),
        &[("q", city), ("appid", key), ("units", "metric")],
    )
    .map_err(|error| Error::ValidationError {
        details: format!("invalid weather request for city {}: {}", city, error),
    })
}

/// # get the current weather for a city
pub async fn get_current_weather(city: &str) -> CustomResult<CurrentWeather> {
    info!(target:"weather_api", "Getting current weather for {}", city);
    let url = request_url("weather", city, &api_key()?)?;
    fetch(url, city).await
}

/// # get the forecast for a city
pub async fn get_forecast(city: &str) -> CustomResult<WeatherForecast> {
    info!(target:"weather_api", "Getting forecast for {}", city);
    let url = request_url("forecast", city, &api_key()?)?;
    fetch(url, city).await
}

async fn fetch<T: serde::de::DeserializeOwned>(url: Url, city: &str) -> CustomResult<T> {
    let response = reqwest::get(url).await.map_err(|error| Error::ConnectivityError {
        details: format!("weather api unreachable: {}", error),
    })?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::ValidationError {
            details: format!("city not found: {}", city),
        });
    }
    if !response.status().is_success() {
        return Err(Error::ConnectivityError {
            details: format!("weather api returned {}", response.status()),
        });
    }

    response.json::<T>().await.map_err(|error| Error::ConnectivityError {
        details: format!("malformed weather response: {}", error),
    })
}

/// # read a cached current-weather report
/// cache misses and redis trouble both fall back to a live fetch.
pub fn read_cached_weather(city: &str) -> Option<CurrentWeather> {
    let r_conn = &mut Redis::connect().ok()?;
    let data: String = Redis::get_data(r_conn, format!("weather:{}", city)).ok()?;
    serde_json::from_str(&data).ok()
}

/// # store a current-weather report with a ttl
pub fn write_weather_cache(city: &str, weather: &CurrentWeather) {
    let r_conn = &mut match Redis::connect() {
        Ok(r_conn) => r_conn,
        Err(e) => {
            error!(target:"weather_api", "Error connecting to redis: {}", e);
            return;
        }
    };

    match serde_json::to_string(weather) {
        Ok(data) => {
            if let Err(e) =
                Redis::set_data_ex::<String, String>(r_conn, format!("weather:{}", city), data, CACHE_SECONDS)
            {
                error!(target:"weather_api", "Error caching weather for {}: {}", city, e);
            }
        }
        Err(e) => error!(target:"weather_api", "Error serializing weather for {}: {}", city, e),
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CurrentWeather {
    pub name: String,
    pub main: WeatherMain,
    pub weather: Vec<WeatherCondition>,
    pub wind: WeatherWind,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WeatherMain {
    pub temp: f64,
    pub feels_like: f64,
    pub humidity: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WeatherCondition {
    pub main: String,
    pub description: String,
    pub icon: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WeatherWind {
    pub speed: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WeatherForecast {
    pub city: ForecastCity,
    pub list: Vec<ForecastEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ForecastCity {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ForecastEntry {
    pub dt: i64,
    pub main: WeatherMain,
    pub weather: Vec<WeatherCondition>,
    pub wind: WeatherWind,
}
