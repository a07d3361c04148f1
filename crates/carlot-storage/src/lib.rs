//! SQLite-backed car catalog + HTTP fetch utilities.

use std::path::Path;
use std::str::FromStr;

use carlot_core::{Car, CarStatus, CoercionError, NewCar};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;

mod fetch;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedPage, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};

const CAR_COLUMNS: &str = "id, make, model, year, price, mileage, status, vin, image_url, link";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("a car with VIN {0} already exists")]
    DuplicateVin(String),
    #[error("car {id} has an unreadable row: {source}")]
    InvalidRow {
        id: i64,
        #[source]
        source: CoercionError,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, FromRow)]
struct CarRow {
    id: i64,
    make: String,
    model: String,
    year: i32,
    price: f64,
    mileage: i64,
    status: String,
    vin: Option<String>,
    image_url: Option<String>,
    link: Option<String>,
}

impl TryFrom<CarRow> for Car {
    type Error = StoreError;

    fn try_from(row: CarRow) -> Result<Self, Self::Error> {
        let status = CarStatus::from_str(&row.status)
            .map_err(|source| StoreError::InvalidRow { id: row.id, source })?;
        Ok(Car {
            id: row.id,
            make: row.make,
            model: row.model,
            year: row.year,
            price: row.price,
            mileage: row.mileage,
            status,
            vin: row.vin,
            image_url: row.image_url,
            link: row.link,
        })
    }
}

fn rows_to_cars(rows: Vec<CarRow>) -> StoreResult<Vec<Car>> {
    rows.into_iter().map(Car::try_from).collect()
}

/// Turns a unique-index violation on `vin` into [`StoreError::DuplicateVin`].
fn map_write_error(err: sqlx::Error, car: &NewCar) -> StoreError {
    match (&err, &car.vin) {
        (sqlx::Error::Database(db), Some(vin)) if db.is_unique_violation() => {
            StoreError::DuplicateVin(vin.clone())
        }
        _ => StoreError::Sqlx(err),
    }
}

/// Escapes LIKE wildcards so the search term matches as a literal substring.
pub fn like_contains_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

#[derive(Debug, Clone)]
pub struct CarStore {
    pool: SqlitePool,
}

impl CarStore {
    /// Connects to a `sqlite:` URL, creating the database file if it is missing.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        Self::connect_with(options).await
    }

    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// All cars, or those whose make, model or status contains `search` (ASCII case-insensitive).
    pub async fn list(&self, search: Option<&str>) -> StoreResult<Vec<Car>> {
        let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) else {
            let sql = format!("SELECT {CAR_COLUMNS} FROM cars ORDER BY id");
            let rows = sqlx::query_as::<_, CarRow>(&sql).fetch_all(&self.pool).await?;
            return rows_to_cars(rows);
        };

        let pattern = like_contains_pattern(term);
        let sql = format!(
            r"SELECT {CAR_COLUMNS}
                FROM cars
               WHERE make LIKE ? ESCAPE '\'
                  OR model LIKE ? ESCAPE '\'
                  OR status LIKE ? ESCAPE '\'
               ORDER BY id"
        );
        let rows = sqlx::query_as::<_, CarRow>(&sql)
            .bind(&pattern)
            .bind(&pattern)
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await?;
        rows_to_cars(rows)
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<Car>> {
        let row = sqlx::query_as::<_, CarRow>(&format!("SELECT {CAR_COLUMNS} FROM cars WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Car::try_from).transpose()
    }

    pub async fn count(&self) -> StoreResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cars")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn insert(&self, car: &NewCar) -> StoreResult<Car> {
        let car = car.clone().normalized();
        let id = insert_car(&self.pool, &car).await?;
        Ok(with_id(id, car))
    }

    /// Overwrites every field of car `id`. Returns `None` when no such car exists.
    pub async fn update(&self, id: i64, car: &NewCar) -> StoreResult<Option<Car>> {
        let car = car.clone().normalized();
        let result = sqlx::query(
            r#"
            UPDATE cars
               SET make = ?, model = ?, year = ?, price = ?, mileage = ?,
                   status = ?, vin = ?, image_url = ?, link = ?
             WHERE id = ?
            "#,
        )
        .bind(&car.make)
        .bind(&car.model)
        .bind(car.year)
        .bind(car.price)
        .bind(car.mileage)
        .bind(car.status.as_str())
        .bind(&car.vin)
        .bind(&car.image_url)
        .bind(&car.link)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| map_write_error(err, &car))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(with_id(id, car)))
    }

    /// Returns `false` when no car with `id` existed.
    pub async fn delete(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM cars WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Opens a write batch. Nothing it inserts is visible to other connections until
    /// [`CarBatch::commit`]; dropping the batch rolls everything back.
    pub async fn begin_batch(&self) -> StoreResult<CarBatch> {
        let tx = self.pool.begin().await?;
        Ok(CarBatch { tx, inserted: 0 })
    }
}

fn with_id(id: i64, car: NewCar) -> Car {
    Car {
        id,
        make: car.make,
        model: car.model,
        year: car.year,
        price: car.price,
        mileage: car.mileage,
        status: car.status,
        vin: car.vin,
        image_url: car.image_url,
        link: car.link,
    }
}

async fn insert_car<'e, E>(executor: E, car: &NewCar) -> StoreResult<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO cars (make, model, year, price, mileage, status, vin, image_url, link)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&car.make)
    .bind(&car.model)
    .bind(car.year)
    .bind(car.price)
    .bind(car.mileage)
    .bind(car.status.as_str())
    .bind(&car.vin)
    .bind(&car.image_url)
    .bind(&car.link)
    .execute(executor)
    .await
    .map_err(|err| map_write_error(err, car))?;
    Ok(result.last_insert_rowid())
}

/// One transaction's worth of lookups and inserts. Lookups see the batch's own inserts.
pub struct CarBatch {
    tx: Transaction<'static, Sqlite>,
    inserted: usize,
}

impl CarBatch {
    pub async fn find_by_vin(&mut self, vin: &str) -> StoreResult<Option<Car>> {
        let row = sqlx::query_as::<_, CarRow>(&format!(
            "SELECT {CAR_COLUMNS} FROM cars WHERE vin = ? LIMIT 1"
        ))
        .bind(vin)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Car::try_from).transpose()
    }

    /// Exact, case-sensitive match on the (make, model, year) identity.
    pub async fn find_by_identity(
        &mut self,
        make: &str,
        model: &str,
        year: i32,
    ) -> StoreResult<Option<Car>> {
        let row = sqlx::query_as::<_, CarRow>(&format!(
            "SELECT {CAR_COLUMNS} FROM cars WHERE make = ? AND model = ? AND year = ? ORDER BY id LIMIT 1"
        ))
        .bind(make)
        .bind(model)
        .bind(year)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Car::try_from).transpose()
    }

    pub async fn insert(&mut self, car: &NewCar) -> StoreResult<i64> {
        let car = car.clone().normalized();
        let id = insert_car(&mut *self.tx, &car).await?;
        self.inserted += 1;
        debug!(id, make = %car.make, model = %car.model, "staged car insert");
        Ok(id)
    }

    /// Commits the batch and returns how many rows it inserted.
    pub async fn commit(self) -> StoreResult<usize> {
        self.tx.commit().await?;
        Ok(self.inserted)
    }
}
