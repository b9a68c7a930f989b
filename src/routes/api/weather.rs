use rocket::get;
use rocket::serde::json::Json;

use crate::modules::weather_api::{
    self, get_current_weather, get_forecast, CurrentWeather, WeatherForecast,
};
use crate::routes::api::ApiResult;

/// current conditions for a city, served from the cron-warmed cache when
/// fresh enough, otherwise fetched live.
#[get("/weather/current?<city>")]
pub async fn current(city: String) -> ApiResult<CurrentWeather> {
    if let Some(cached) = weather_api::read_cached_weather(&city) {
        return Ok(Json(cached));
    }

    let weather = get_current_weather(&city).await?;
    weather_api::write_weather_cache(&city, &weather);
    Ok(Json(weather))
}

#[get("/weather/forecast?<city>")]
pub async fn forecast(city: String) -> ApiResult<WeatherForecast> {
    let forecast = get_forecast(&city).await?;
    Ok(Json(forecast))
}
