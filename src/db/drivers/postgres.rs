// PostgreSQL Driver
// bb8-backed pools over tokio-postgres, and the conversion of wire values into
// DriverValue. Nothing driver-native escapes this module.

use bb8::Pool;
use bb8_postgres::PostgresConnectionManager as Bb8PostgresManager;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use std::error::Error as StdError;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tokio_postgres::{Config, NoTls, Row};

use crate::db::traits::{
    DatabaseError, DriverValue, PoolConnector, RowSet, SqlParam, SqlPool,
};
use crate::storage::PoolSettings;

pub type PostgresPool = Pool<Bb8PostgresManager<NoTls>>;

/// Opens bb8 pools sized and timed by the stored pool settings
pub struct PostgresConnector {
    max_connections: u32,
    connect_timeout: Duration,
}

impl PostgresConnector {
    pub fn new(settings: &PoolSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
        }
    }
}

#[async_trait::async_trait]
impl PoolConnector for PostgresConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn SqlPool>, DatabaseError> {
        let config = Config::from_str(endpoint)
            .map_err(|e| DatabaseError::InvalidConfig(e.to_string()))?;
        let manager = Bb8PostgresManager::new(config, NoTls);

        // min_idle makes build() establish a connection, so bad hosts and
        // rejected credentials fail here instead of on the first statement
        let pool = Pool::builder()
            .max_size(self.max_connections)
            .min_idle(Some(1))
            .connection_timeout(self.connect_timeout)
            .build(manager)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Arc::new(PgPool::new(pool)))
    }
}

/// A closable wrapper around a bb8 pool
pub struct PgPool {
    inner: Mutex<Option<PostgresPool>>,
    closed: AtomicBool,
}

impl PgPool {
    pub fn new(pool: PostgresPool) -> Self {
        Self {
            inner: Mutex::new(Some(pool)),
            closed: AtomicBool::new(false),
        }
    }

    /// Clone of the live pool; statements already running keep their own clone
    fn live(&self) -> Result<PostgresPool, DatabaseError> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone().ok_or(DatabaseError::PoolClosed)
    }
}

fn bind(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait::async_trait]
impl SqlPool for PgPool {
    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, DatabaseError> {
        let pool = self.live()?;
        let conn = pool.get().await?;
        let count = conn.execute(sql, &bind(params)).await?;
        Ok(count)
    }

    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<RowSet, DatabaseError> {
        let pool = self.live()?;
        let conn = pool.get().await?;
        let statement = conn.prepare(sql).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let rows = conn.query(&statement, &bind(params)).await?;

        let rows = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RowSet { columns, rows })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Dropping the manager's handle releases idle connections; checked-out
            // ones go away as soon as their statement finishes
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.take();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn decode_row(row: &Row) -> Result<Vec<DriverValue>, DatabaseError> {
    (0..row.len())
        .map(|idx| decode_value(row, idx).map_err(decode_error))
        .collect()
}

// tokio-postgres only names the column; the reason sits in the source error
fn decode_error(err: tokio_postgres::Error) -> DatabaseError {
    match err.source() {
        Some(source) => DatabaseError::Decode(format!("{}: {}", err, source)),
        None => DatabaseError::Decode(err.to_string()),
    }
}

fn decode_value(row: &Row, idx: usize) -> Result<DriverValue, tokio_postgres::Error> {
    let ty = row.columns()[idx].type_();

    let value = match *ty {
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(DriverValue::Bytes),
        Type::TIMESTAMPTZ | Type::TIMESTAMP | Type::DATE => {
            row.try_get::<_, Option<PgInstant>>(idx)?.map(|v| match v {
                PgInstant::At(ts) => DriverValue::Timestamp(ts),
                PgInstant::Text(text) => DriverValue::Other(text),
            })
        }
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|v| DriverValue::FixedId16(*v.as_bytes())),
        _ if <String as FromSql>::accepts(ty) => row.try_get::<_, Option<String>>(idx)?.map(DriverValue::Text),
        _ => row.try_get::<_, Option<PgText>>(idx)?.map(|v| match ty.kind() {
            Kind::Enum(_) => DriverValue::Text(v.0),
            _ => DriverValue::Other(v.0),
        }),
    };

    Ok(value.unwrap_or(DriverValue::Null))
}

type BoxError = Box<dyn StdError + Sync + Send>;

/// Default text form of a value of any type, built from its binary encoding
struct PgText(String);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        render_binary(ty, raw).map(PgText)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// A timestamp or date. Values chrono cannot hold (`infinity`, far-future
/// years) keep the text the server would print.
enum PgInstant {
    At(DateTime<Utc>),
    Text(String),
}

impl<'a> FromSql<'a> for PgInstant {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if *ty == Type::DATE {
            decode_date(raw)
        } else {
            decode_timestamp(raw)
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(*ty, Type::TIMESTAMP | Type::TIMESTAMPTZ | Type::DATE)
    }
}

impl PgInstant {
    fn into_text(self) -> String {
        match self {
            PgInstant::At(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            PgInstant::Text(text) => text,
        }
    }
}

fn pg_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .unwrap_or_default()
        .and_time(NaiveTime::default())
}

/// Microseconds since 2000-01-01, with i64::MAX/MIN as +/-infinity
fn decode_timestamp(raw: &[u8]) -> Result<PgInstant, BoxError> {
    let micros = read_i64(raw, 0)?;
    let instant = match micros {
        i64::MAX => PgInstant::Text("infinity".to_string()),
        i64::MIN => PgInstant::Text("-infinity".to_string()),
        _ => match pg_epoch().checked_add_signed(chrono::Duration::microseconds(micros)) {
            Some(ts) => PgInstant::At(Utc.from_utc_datetime(&ts)),
            None => PgInstant::Text(format!("{} microseconds after 2000-01-01", micros)),
        },
    };
    Ok(instant)
}

/// Days since 2000-01-01, with i32::MAX/MIN as +/-infinity
fn decode_date(raw: &[u8]) -> Result<PgInstant, BoxError> {
    let days = read_i32(raw, 0)?;
    let instant = match days {
        i32::MAX => PgInstant::Text("infinity".to_string()),
        i32::MIN => PgInstant::Text("-infinity".to_string()),
        _ => match pg_epoch().checked_add_signed(chrono::Duration::days(i64::from(days))) {
            Some(ts) => PgInstant::At(Utc.from_utc_datetime(&ts)),
            None => PgInstant::Text(format!("{} days after 2000-01-01", days)),
        },
    };
    Ok(instant)
}

fn read_bytes<const N: usize>(raw: &[u8], at: usize) -> Result<[u8; N], BoxError> {
    raw.get(at..at + N)
        .and_then(|b| <[u8; N]>::try_from(b).ok())
        .ok_or_else(|| "truncated value".into())
}

fn read_u8(raw: &[u8], at: usize) -> Result<u8, BoxError> {
    read_bytes::<1>(raw, at).map(|b| b[0])
}

fn read_u16(raw: &[u8], at: usize) -> Result<u16, BoxError> {
    read_bytes(raw, at).map(u16::from_be_bytes)
}

fn read_i32(raw: &[u8], at: usize) -> Result<i32, BoxError> {
    read_bytes(raw, at).map(i32::from_be_bytes)
}

fn read_i64(raw: &[u8], at: usize) -> Result<i64, BoxError> {
    read_bytes(raw, at).map(i64::from_be_bytes)
}

fn read_f64(raw: &[u8], at: usize) -> Result<f64, BoxError> {
    read_bytes(raw, at).map(f64::from_be_bytes)
}

/// Render a binary-format value the way a client would print it.
/// Types without a known layout fall back to `<typename>`.
fn render_binary(ty: &Type, raw: &[u8]) -> Result<String, BoxError> {
    match ty.kind() {
        Kind::Array(element) => return render_array(element, raw),
        Kind::Domain(base) => return render_binary(base, raw),
        // Enum labels travel as plain text in the binary format too
        Kind::Enum(_) => return Ok(String::from_utf8_lossy(raw).into_owned()),
        _ => {}
    }

    let text = match *ty {
        Type::BOOL => bool::from_sql(ty, raw)?.to_string(),
        Type::INT2 => i16::from_sql(ty, raw)?.to_string(),
        Type::INT4 => i32::from_sql(ty, raw)?.to_string(),
        Type::INT8 => i64::from_sql(ty, raw)?.to_string(),
        Type::OID => u32::from_sql(ty, raw)?.to_string(),
        Type::FLOAT4 => f32::from_sql(ty, raw)?.to_string(),
        Type::FLOAT8 => f64::from_sql(ty, raw)?.to_string(),
        Type::CHAR => i8::from_sql(ty, raw)?.to_string(),
        Type::NUMERIC => decode_numeric(raw)?,
        Type::BYTEA => raw.iter().fold("\\x".to_string(), |mut hex, b| {
            hex.push_str(&format!("{:02x}", b));
            hex
        }),
        Type::TIMESTAMP | Type::TIMESTAMPTZ | Type::DATE => PgInstant::from_sql(ty, raw)?.into_text(),
        Type::TIME => NaiveTime::from_sql(ty, raw)?.to_string(),
        Type::UUID => uuid::Uuid::from_sql(ty, raw)?.hyphenated().to_string(),
        Type::JSON | Type::JSONB => serde_json::Value::from_sql(ty, raw)?.to_string(),
        Type::INTERVAL => render_interval(raw)?,
        Type::INET | Type::CIDR => render_inet(raw)?,
        Type::MONEY => render_money(read_i64(raw, 0)?),
        Type::BIT | Type::VARBIT => render_bits(raw)?,
        Type::MACADDR | Type::MACADDR8 => raw
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":"),
        Type::POINT => format!("({},{})", read_f64(raw, 0)?, read_f64(raw, 8)?),
        _ if <String as FromSql>::accepts(ty) => String::from_sql(ty, raw)?,
        _ => format!("<{}>", ty.name()),
    };

    Ok(text)
}

/// Postgres array layout: ndim, has-null flag, element oid, (length, lower bound)
/// per dimension, then length-prefixed elements with -1 for NULL
fn render_array(element: &Type, raw: &[u8]) -> Result<String, BoxError> {
    let ndim = usize::try_from(read_i32(raw, 0)?)?;
    let dims = (0..ndim)
        .map(|d| -> Result<usize, BoxError> { Ok(usize::try_from(read_i32(raw, 12 + d * 8)?)?) })
        .collect::<Result<Vec<_>, _>>()?;

    let mut cursor = 12 + ndim * 8;
    let total = if dims.is_empty() { 0 } else { dims.iter().product() };
    let mut elements = Vec::with_capacity(total);
    for _ in 0..total {
        let len = read_i32(raw, cursor)?;
        cursor += 4;
        if len < 0 {
            elements.push("NULL".to_string());
            continue;
        }
        let len = len as usize;
        let bytes = raw
            .get(cursor..cursor + len)
            .ok_or("truncated array element")?;
        cursor += len;
        elements.push(quote_array_element(render_binary(element, bytes)?));
    }

    Ok(nest_array(&dims, &mut elements.into_iter()))
}

fn nest_array<I: Iterator<Item = String>>(dims: &[usize], elements: &mut I) -> String {
    let items: Vec<String> = match dims {
        [] => Vec::new(),
        [len] => elements.take(*len).collect(),
        [len, rest @ ..] => (0..*len).map(|_| nest_array(rest, &mut *elements)).collect(),
    };
    format!("{{{}}}", items.join(","))
}

fn quote_array_element(text: String) -> String {
    let needs_quotes = text.is_empty()
        || text.eq_ignore_ascii_case("NULL")
        || text
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
    if !needs_quotes {
        return text;
    }
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Interval layout: microseconds, days, months; printed in the server's
/// default `postgres` style
fn render_interval(raw: &[u8]) -> Result<String, BoxError> {
    let micros = read_i64(raw, 0)?;
    let days = read_i32(raw, 8)?;
    let months = read_i32(raw, 12)?;

    let unit = |n: i32, name: &str| {
        if n == 1 {
            format!("1 {}", name)
        } else {
            format!("{} {}s", n, name)
        }
    };

    let mut parts = Vec::new();
    if months / 12 != 0 {
        parts.push(unit(months / 12, "year"));
    }
    if months % 12 != 0 {
        parts.push(unit(months % 12, "mon"));
    }
    if days != 0 {
        parts.push(unit(days, "day"));
    }
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let abs = micros.unsigned_abs();
        let secs = abs / 1_000_000;
        let mut clock = format!(
            "{}{:02}:{:02}:{:02}",
            sign,
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
        let fraction = abs % 1_000_000;
        if fraction != 0 {
            clock.push('.');
            clock.push_str(format!("{:06}", fraction).trim_end_matches('0'));
        }
        parts.push(clock);
    }

    Ok(parts.join(" "))
}

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// inet/cidr layout: family, prefix bits, cidr flag, address length, address
fn render_inet(raw: &[u8]) -> Result<String, BoxError> {
    let family = read_u8(raw, 0)?;
    let bits = read_u8(raw, 1)?;
    let is_cidr = read_u8(raw, 2)? != 0;
    let len = usize::from(read_u8(raw, 3)?);
    let address = raw.get(4..4 + len).ok_or("truncated inet value")?;

    let (ip, max_bits) = match family {
        PGSQL_AF_INET => (IpAddr::from(<[u8; 4]>::try_from(address)?), 32),
        PGSQL_AF_INET6 => (IpAddr::from(<[u8; 16]>::try_from(address)?), 128),
        other => return Err(format!("unknown inet address family {}", other).into()),
    };

    if is_cidr || bits != max_bits {
        Ok(format!("{}/{}", ip, bits))
    } else {
        Ok(ip.to_string())
    }
}

/// money is a count of cents; the server's currency symbol is locale-bound and
/// not part of the wire value
fn render_money(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// bit/varbit layout: bit count, then the bits packed most significant first
fn render_bits(raw: &[u8]) -> Result<String, BoxError> {
    let count = usize::try_from(read_i32(raw, 0)?)?;
    let packed = raw.get(4..).unwrap_or_default();
    (0..count)
        .map(|i| -> Result<char, BoxError> {
            let byte = packed.get(i / 8).ok_or("truncated bit string")?;
            Ok(if byte & (0x80 >> (i % 8)) != 0 { '1' } else { '0' })
        })
        .collect()
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Binary NUMERIC: ndigits, weight, sign, dscale, then base-10000 digit groups
fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let ndigits = read_u16(raw, 0)? as usize;
    let weight = read_u16(raw, 2)? as i16 as i64;
    let sign = read_u16(raw, 4)?;
    let dscale = read_u16(raw, 6)? as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| read_u16(raw, 8 + i * 2))
        .collect::<Result<Vec<_>, _>>()?;
    let digit_at = |idx: i64| -> u16 {
        if idx >= 0 {
            digits.get(idx as usize).copied().unwrap_or(0)
        } else {
            0
        }
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        for idx in 0..=weight {
            if idx == 0 {
                text.push_str(&digit_at(idx).to_string());
            } else {
                text.push_str(&format!("{:04}", digit_at(idx)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut idx = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(idx)));
            idx += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(text)
}
