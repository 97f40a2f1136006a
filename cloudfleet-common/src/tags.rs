use chrono::{DateTime, SecondsFormat, Utc};

use crate::{LaunchMode, TagSet};

/// Every key starting with this prefix is owned by the engine.
pub const RESERVED_PREFIX: &str = "cloudfleet_";

/// Identity of the engine instance that launched the worker.
pub const TAG_MANAGED_BY: &str = "cloudfleet_managed_by";
/// Cloud (configuration entry) the worker belongs to.
pub const TAG_CLOUD: &str = "cloudfleet_cloud";
pub const TAG_TEMPLATE: &str = "cloudfleet_template";
/// `demand` or `spot`.
pub const TAG_LAUNCH_MODE: &str = "cloudfleet_launch_mode";
/// RFC3339 timestamp of the last time the owning engine saw the instance.
pub const TAG_LAST_SEEN: &str = "cloudfleet_last_seen";

/// Most clouds cap the number of resources per tagging call.
pub const MAX_TAG_BATCH: usize = 500;

pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// Classification tags written at launch time.
pub fn classification(engine_id: &str, cloud: &str, template: &str, mode: LaunchMode) -> TagSet {
    let mut tags = TagSet::new();
    tags.insert(TAG_MANAGED_BY.to_string(), engine_id.to_string());
    tags.insert(TAG_CLOUD.to_string(), cloud.to_string());
    tags.insert(TAG_TEMPLATE.to_string(), template.to_string());
    tags.insert(TAG_LAUNCH_MODE.to_string(), mode.tag_value().to_string());
    tags
}

/// Filter tags identifying every instance a given engine owns in a cloud.
pub fn ownership_filter(engine_id: &str, cloud: &str) -> TagSet {
    let mut tags = TagSet::new();
    tags.insert(TAG_MANAGED_BY.to_string(), engine_id.to_string());
    tags.insert(TAG_CLOUD.to_string(), cloud.to_string());
    tags
}

/// Classification first, then user tags. Reserved user keys are rejected
/// when the template is built, so nothing is overwritten here.
pub fn merge_user_tags<'a, I>(mut tags: TagSet, user: I) -> TagSet
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (k, v) in user {
        tags.entry(k.to_string()).or_insert_with(|| v.to_string());
    }
    tags
}

pub fn is_owned_by(tags: &TagSet, engine_id: &str, cloud: &str) -> bool {
    tags.get(TAG_MANAGED_BY).map(String::as_str) == Some(engine_id)
        && tags.get(TAG_CLOUD).map(String::as_str) == Some(cloud)
}

pub fn template_of(tags: &TagSet) -> Option<&str> {
    tags.get(TAG_TEMPLATE).map(String::as_str)
}

pub fn heartbeat_value(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn heartbeat_tag(now: DateTime<Utc>) -> TagSet {
    let mut tags = TagSet::new();
    tags.insert(TAG_LAST_SEEN.to_string(), heartbeat_value(now));
    tags
}

/// Parsed heartbeat. An unparseable value reads as absent.
pub fn parse_heartbeat(tags: &TagSet) -> Option<DateTime<Utc>> {
    tags.get(TAG_LAST_SEEN)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
