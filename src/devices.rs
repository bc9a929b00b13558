use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::Device;

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Registration {
    pub device_id: Option<String>,
    pub push_token: Option<String>,
    pub platform: Option<Platform>,
}

/// Creates or replaces the push target of a device. Devices are anonymous:
/// whoever holds the device id may re-register it.
pub fn register(conn: &SqliteConnection, clock: &dyn Clock, registration: Registration) -> Result<()> {
    use crate::schema::devices::dsl::*;

    let (new_device_id, new_push_token, new_platform) = match (
        non_empty(registration.device_id),
        non_empty(registration.push_token),
        registration.platform,
    ) {
        (Some(d), Some(t), Some(p)) => (d, t, p),
        (d, t, p) => {
            let mut missing = Vec::new();
            if d.is_none() {
                missing.push("device_id".to_owned());
            }
            if t.is_none() {
                missing.push("push_token".to_owned());
            }
            if p.is_none() {
                missing.push("platform".to_owned());
            }
            return Err(Error::MissingFieldError(missing));
        }
    };

    diesel::replace_into(devices)
        .values((
            device_id.eq(&new_device_id),
            push_token.eq(&new_push_token),
            platform.eq(new_platform.as_str()),
            updated_at.eq(clock.now()),
        ))
        .execute(conn)?;
    debug!(device_id = %new_device_id, platform = new_platform.as_str(), "registered push target");
    Ok(())
}

pub fn unregister(conn: &SqliteConnection, id: &str) -> Result<bool> {
    use crate::schema::devices::dsl::{device_id, devices};

    let removed = diesel::delete(devices.filter(device_id.eq(id))).execute(conn)?;
    Ok(removed > 0)
}

pub fn targets_for_event(conn: &SqliteConnection, event: i32) -> Result<Vec<Device>> {
    use crate::schema::{devices, interests};

    Ok(interests::table
        .inner_join(devices::table.on(devices::device_id.eq(interests::device_id)))
        .filter(interests::event_id.eq(event))
        .select(devices::all_columns)
        .order(devices::device_id.asc())
        .load::<Device>(conn)?)
}

pub fn prune(conn: &SqliteConnection, ids: &[String]) -> Result<usize> {
    use crate::schema::devices::dsl::{device_id, devices};

    if ids.is_empty() {
        return Ok(0);
    }
    Ok(diesel::delete(devices.filter(device_id.eq_any(ids))).execute(conn)?)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
