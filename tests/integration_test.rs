use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::Value;
use tower::ServiceExt;

use solarcast::{
    clock::FixedClock,
    forecaster::ForecasterRegistry,
    models::local_day_start,
    routes,
    store::MemoryStore,
    ForecastService, PipelineConfig, Reading,
};

// ---

const TZ: chrono_tz::Tz = chrono_tz::Asia::Seoul;

struct TestApp {
    app: Router,
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
}

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, m, d).unwrap()
}

/// 10:00 local time on `day`.
fn local_morning(day: NaiveDate) -> DateTime<Utc> {
    TZ.from_local_datetime(&day.and_time(NaiveTime::from_hms_opt(10, 0, 0).unwrap()))
        .unwrap()
        .with_timezone(&Utc)
}

fn test_app(today: NaiveDate) -> TestApp {
    // ---
    let config = PipelineConfig::default();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedClock::new(local_morning(today)));
    let service = ForecastService::new(
        store.clone(),
        config.clone(),
        clock.clone(),
        ForecasterRegistry::standard(&config),
    );
    TestApp {
        app: routes::router(Arc::new(service)),
        store,
        clock,
    }
}

/// Daily output with a weekly shape, as hourly readings.
fn hourly_readings(first: NaiveDate, days: u64) -> Vec<Reading> {
    // ---
    let mut readings = Vec::new();
    let mut counter = 5_000.0;
    for i in 0..days {
        let day = first + Days::new(i);
        let energy = 100.0 + 20.0 * ((i % 7) as f64 / 6.0) + (i % 3) as f64;
        let irradiance = 300.0 + 10.0 * ((i * 37) % 23) as f64;
        let start = local_day_start(TZ, day);
        for h in 0..24u32 {
            let mut r = Reading::at(start + Duration::hours(i64::from(h)));
            r.cumulative_mwh = Some(counter + energy * f64::from(h) / 23.0);
            r.power_mw = Some(if (7..=20).contains(&h) { energy / 14.0 } else { 0.0 });
            r.forecast_irradiance_wm2 = Some(irradiance);
            r.forecast_temperature_c = Some(15.0 + (i % 5) as f64);
            r.forecast_wind_speed_ms = Some(2.0 + (i % 4) as f64);
            readings.push(r);
        }
        counter += energy;
    }
    readings
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    // ---
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn ingest(app: &Router, readings: &[Reading]) {
    // ---
    let payload = serde_json::to_value(readings).unwrap();
    let (status, body) = send(app, "POST", "/readings", Some(payload)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["upserted"], readings.len());
}

#[tokio::test]
async fn health_endpoint_ok() {
    // ---
    let t = test_app(date(6, 20));
    let (status, body) = send(&t.app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn ingest_is_idempotent_per_timestamp() {
    // ---
    let t = test_app(date(6, 20));
    let readings = hourly_readings(date(6, 18), 2);

    ingest(&t.app, &readings).await;
    ingest(&t.app, &readings).await;
    assert_eq!(t.store.reading_count().await, 48);

    let uri = format!(
        "/readings?start={}&end={}",
        local_day_start(TZ, date(6, 19)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        local_day_start(TZ, date(6, 20)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    let (status, body) = send(&t.app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 24);
}

#[tokio::test]
async fn readings_summary_per_calendar_period() {
    // ---
    let t = test_app(date(6, 20));
    ingest(&t.app, &hourly_readings(date(6, 1), 3)).await;

    let (status, day) = send(&t.app, "GET", "/readings/summary?type=day&date=2025-06-01", None).await;
    assert_eq!(status, StatusCode::OK, "{day}");
    assert_eq!(day["period"], "2025-06-01");
    assert_eq!(day["readings"], 24);
    // Day 0 of the fixture produces 100 MWh
    assert!((day["total_mwh"].as_f64().unwrap() - 100.0).abs() < 1e-6);

    let (status, month) =
        send(&t.app, "GET", "/readings/summary?type=month&date=2025-06-15", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(month["period"], "2025-06");
    assert_eq!(month["readings"], 72);
    assert!(month["avg_irradiance_wm2"].as_f64().is_some());

    let (status, body) =
        send(&t.app, "GET", "/readings/summary?type=weekly&date=2025-06-15", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");
}

#[tokio::test]
async fn run_without_history_is_insufficient_data() {
    // ---
    let t = test_app(date(6, 20));
    ingest(&t.app, &hourly_readings(date(6, 17), 3)).await;

    let (status, body) = send(&t.app, "POST", "/forecast/next_day/run", None).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error_kind"], "insufficient_data");
    assert_eq!(body["records"].as_array().unwrap().len(), 0);

    let (_, listed) = send(&t.app, "GET", "/forecast/next_day", None).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn next_day_run_persists_one_bounded_record() {
    // ---
    let t = test_app(date(6, 20));
    ingest(&t.app, &hourly_readings(date(5, 21), 30)).await;

    let (status, body) = send(&t.app, "POST", "/forecast/next_day/run", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "done");

    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["forecast_start"], "2025-06-21");
    let predicted = records[0]["predicted_mwh"].as_f64().unwrap();
    // Largest training day is 122 MWh, so the clamp limit is 146.4
    assert!((0.0..=146.4 + 1e-6).contains(&predicted), "predicted {predicted}");

    // Rerunning replaces the record
    let (status, _) = send(&t.app, "POST", "/forecast/next_day/run", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, listed) = send(&t.app, "GET", "/forecast/next_day", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn seven_day_run_persists_a_week() {
    // ---
    let t = test_app(date(6, 20));
    ingest(&t.app, &hourly_readings(date(5, 21), 30)).await;

    let (status, body) = send(&t.app, "POST", "/forecast/seven_day/run", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 7);
    assert_eq!(records[0]["forecast_start"], "2025-06-20");
    assert_eq!(records[6]["forecast_start"], "2025-06-26");
    for r in records {
        let v = r["predicted_mwh"].as_f64().unwrap();
        assert!((0.0..=146.4 + 1e-6).contains(&v), "predicted {v}");
        assert!(r["actual_mwh"].is_null());
    }
}

#[tokio::test]
async fn reconcile_fills_in_actuals_and_accuracy() {
    // ---
    let t = test_app(date(6, 20));
    ingest(&t.app, &hourly_readings(date(5, 21), 30)).await;

    let (status, _) = send(&t.app, "POST", "/forecast/next_day/run", None).await;
    assert_eq!(status, StatusCode::OK);

    // Tomorrow happens
    ingest(&t.app, &hourly_readings(date(6, 20), 2)).await;
    t.clock.set(local_morning(date(6, 22)));

    let (status, summary) = send(&t.app, "POST", "/forecast/next_day/reconcile", None).await;
    assert_eq!(status, StatusCode::OK, "{summary}");
    assert_eq!(summary["reconciled"], 1);

    let (_, listed) = send(
        &t.app,
        "GET",
        "/forecast/next_day?start=2025-06-21&end=2025-06-21",
        None,
    )
    .await;
    let record = &listed.as_array().unwrap()[0];
    assert!(record["actual_mwh"].as_f64().is_some());
    assert!(record["rmse"].as_f64().is_some());
    assert!(record["mae"].as_f64().is_some());
    assert!(record["mape"].as_f64().is_some());

    let (status, report) = send(&t.app, "GET", "/forecast/next_day/accuracy", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["count"], 1);
}

#[tokio::test]
async fn unknown_horizon_is_bad_request() {
    // ---
    let t = test_app(date(6, 20));
    let (status, _) = send(&t.app, "POST", "/forecast/monthly/run", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn store_outage_maps_to_503() {
    // ---
    let t = test_app(date(6, 20));
    t.store.set_unavailable(true);

    let (status, body) = send(&t.app, "GET", "/forecast/seven_day", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["kind"], "store_unavailable");

    let (status, body) = send(&t.app, "POST", "/forecast/seven_day/run", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["stage"], "load_training");
}

#[tokio::test]
async fn inverted_date_range_is_rejected() {
    // ---
    let t = test_app(date(6, 20));
    let (status, body) = send(
        &t.app,
        "GET",
        "/forecast/next_day?start=2025-06-30&end=2025-06-01",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");
}
