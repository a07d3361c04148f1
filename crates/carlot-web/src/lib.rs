//! Axum + Askama web UI for the car lot catalog.

use std::future::Future;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{rejection::FormRejection, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Form, Router,
};
use carlot_core::{Car, CarStatus, CoercionError, NewCar};
use carlot_storage::{CarStore, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: CarStore,
}

impl AppState {
    pub fn new(store: CarStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    BadRequest(#[from] CoercionError),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateVin(vin) => {
                AppError::Conflict(format!("a car with VIN {vin} already exists"))
            }
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    status: u16,
    reason: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(msg) => {
                warn!("not found: {msg}");
                StatusCode::NOT_FOUND
            }
            AppError::BadRequest(err) => {
                warn!("rejected form input: {err}");
                StatusCode::BAD_REQUEST
            }
            AppError::Conflict(msg) => {
                warn!("conflict: {msg}");
                StatusCode::CONFLICT
            }
            AppError::Internal(err) => {
                error!("internal error: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let tpl = ErrorTemplate {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.to_string(),
        };
        match tpl.render() {
            Ok(html) => (status, Html(html)).into_response(),
            Err(_) => (status, tpl.message).into_response(),
        }
    }
}

/// Display-ready car; optional fields are empty strings.
#[derive(Debug, Clone)]
struct CarView {
    id: i64,
    make: String,
    model: String,
    year: i32,
    price: String,
    mileage: i64,
    status: &'static str,
    vin: String,
    image_url: String,
    link: String,
}

impl From<Car> for CarView {
    fn from(car: Car) -> Self {
        Self {
            id: car.id,
            make: car.make,
            model: car.model,
            year: car.year,
            price: format!("{:.2}", car.price),
            mileage: car.mileage,
            status: car.status.as_str(),
            vin: car.vin.unwrap_or_default(),
            image_url: car.image_url.unwrap_or_default(),
            link: car.link.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
struct StatusOption {
    value: &'static str,
    selected: bool,
}

fn status_options(current: &str) -> Vec<StatusOption> {
    CarStatus::ALL
        .iter()
        .map(|s| StatusOption {
            value: s.as_str(),
            selected: s.as_str() == current,
        })
        .collect()
}

/// Submitted add/edit form. Numbers stay text until [`CarForm::into_new_car`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CarForm {
    pub make: String,
    pub model: String,
    pub year: String,
    pub price: String,
    pub mileage: String,
    pub status: String,
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

fn required(field: &'static str, value: &str) -> Result<String, CoercionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(CoercionError::Required(field))
    } else {
        Ok(trimmed.to_string())
    }
}

impl CarForm {
    pub fn into_new_car(self) -> Result<NewCar, CoercionError> {
        let year = self
            .year
            .trim()
            .parse()
            .map_err(|_| CoercionError::NotAnInteger {
                field: "year",
                value: self.year.clone(),
            })?;
        let price = self
            .price
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|p| p.is_finite())
            .ok_or_else(|| CoercionError::NotANumber {
                field: "price",
                value: self.price.clone(),
            })?;
        let mileage = self
            .mileage
            .trim()
            .parse()
            .map_err(|_| CoercionError::NotAnInteger {
                field: "mileage",
                value: self.mileage.clone(),
            })?;
        Ok(NewCar {
            make: required("make", &self.make)?,
            model: required("model", &self.model)?,
            year,
            price,
            mileage,
            status: self.status.parse()?,
            vin: self.vin,
            image_url: self.image_url,
            link: self.link,
        }
        .normalized())
    }
}

#[derive(Debug, Default)]
struct FormValues {
    make: String,
    model: String,
    year: String,
    price: String,
    mileage: String,
    vin: String,
    image_url: String,
    link: String,
}

impl From<Car> for FormValues {
    fn from(car: Car) -> Self {
        Self {
            make: car.make,
            model: car.model,
            year: car.year.to_string(),
            price: format!("{:.2}", car.price),
            mileage: car.mileage.to_string(),
            vin: car.vin.unwrap_or_default(),
            image_url: car.image_url.unwrap_or_default(),
            link: car.link.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    search: Option<String>,
}

#[derive(Template)]
#[template(path = "home.html")]
struct HomeTemplate {
    cars: Vec<CarView>,
    search: String,
}

#[derive(Template)]
#[template(path = "car_form.html")]
struct CarFormTemplate {
    heading: String,
    action: String,
    submit_label: &'static str,
    car: FormValues,
    statuses: Vec<StatusOption>,
}

type SharedState = Arc<AppState>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(home_handler).post(home_search_handler))
        .route("/add", get(add_form_handler).post(add_submit_handler))
        .route("/delete/{id}", get(delete_handler))
        .route("/edit/{id}", get(edit_form_handler).post(edit_submit_handler))
        .with_state(Arc::new(state))
}

pub fn web_port_from_env() -> u16 {
    std::env::var("CARLOT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080)
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "serving car lot web UI");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn render_html<T: Template>(tpl: T) -> Result<Response, AppError> {
    let html = tpl
        .render()
        .map_err(|err| anyhow::anyhow!("rendering template: {err}"))?;
    Ok(Html(html).into_response())
}

async fn home_handler(
    State(state): State<SharedState>,
    Query(query): Query<SearchQuery>,
) -> Result<Response, AppError> {
    render_listing(&state, query.search.unwrap_or_default()).await
}

/// `POST /` takes `search` from the form body, falling back to the query string.
async fn home_search_handler(
    State(state): State<SharedState>,
    Query(query): Query<SearchQuery>,
    form: Result<Form<SearchQuery>, FormRejection>,
) -> Result<Response, AppError> {
    let search = form
        .ok()
        .and_then(|Form(body)| body.search)
        .or(query.search)
        .unwrap_or_default();
    render_listing(&state, search).await
}

async fn render_listing(state: &AppState, search: String) -> Result<Response, AppError> {
    let cars = state.store.list(Some(search.as_str())).await?;
    render_html(HomeTemplate {
        cars: cars.into_iter().map(CarView::from).collect(),
        search,
    })
}

async fn add_form_handler() -> Result<Response, AppError> {
    render_html(CarFormTemplate {
        heading: "Add a car".into(),
        action: "/add".into(),
        submit_label: "Add car",
        car: FormValues::default(),
        statuses: status_options(CarStatus::default().as_str()),
    })
}

async fn add_submit_handler(
    State(state): State<SharedState>,
    Form(form): Form<CarForm>,
) -> Result<Response, AppError> {
    let car = state.store.insert(&form.into_new_car()?).await?;
    info!(id = car.id, make = %car.make, model = %car.model, "car added");
    Ok(Redirect::to("/").into_response())
}

async fn delete_handler(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if !state.store.delete(id).await? {
        return Err(AppError::NotFound(format!("car {id}")));
    }
    info!(id, "car deleted");
    Ok(Redirect::to("/").into_response())
}

async fn edit_form_handler(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let car = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("car {id}")))?;
    let statuses = status_options(car.status.as_str());
    render_html(CarFormTemplate {
        heading: format!("Edit {} {} {}", car.year, car.make, car.model),
        action: format!("/edit/{id}"),
        submit_label: "Save changes",
        car: FormValues::from(car),
        statuses,
    })
}

async fn edit_submit_handler(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Form(form): Form<CarForm>,
) -> Result<Response, AppError> {
    if state.store.get(id).await?.is_none() {
        return Err(AppError::NotFound(format!("car {id}")));
    }
    let fields = form.into_new_car()?;
    state
        .store
        .update(id, &fields)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("car {id}")))?;
    info!(id, "car updated");
    Ok(Redirect::to("/").into_response())
}
