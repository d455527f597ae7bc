//! Event records: a thin, queryable view over one JSON line of the feed.

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use thiserror::Error;

/// Date format used by the feed for `created_at`
pub const FEED_DATE_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Errors raised while building a [`Record`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("line is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("record has no `text` field")]
    MissingText,

    #[error("invalid date `{0}`")]
    InvalidDate(String),

    #[error("invalid location `{0}`")]
    InvalidLocation(String),
}

/// Items that carry a creation time and their original line
pub trait Timestamped {
    fn timestamp(&self) -> Option<NaiveDateTime>;

    fn raw_line(&self) -> &str;
}

/// A longitude/latitude pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

/// An axis-aligned box given by its south-west and north-east corners
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub sw: Coordinates,
    pub ne: Coordinates,
}

impl BoundingBox {
    /// The smallest box containing every point
    pub fn enclosing(points: &[Coordinates]) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = BoundingBox { sw: *first, ne: *first };
        for p in &points[1..] {
            bbox.sw.lon = bbox.sw.lon.min(p.lon);
            bbox.sw.lat = bbox.sw.lat.min(p.lat);
            bbox.ne.lon = bbox.ne.lon.max(p.lon);
            bbox.ne.lat = bbox.ne.lat.max(p.lat);
        }
        Some(bbox)
    }

    pub fn contains(&self, c: Coordinates) -> bool {
        self.sw.lon <= c.lon && c.lon <= self.ne.lon && self.sw.lat <= c.lat && c.lat <= self.ne.lat
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.sw.lat > other.ne.lat
            || self.sw.lon > other.ne.lon
            || self.ne.lat < other.sw.lat
            || self.ne.lon < other.sw.lon)
    }

    /// `sw_lon,sw_lat,ne_lon,ne_lat`, the order the feed expects
    pub fn to_param(&self) -> String {
        format!("{},{},{},{}", self.sw.lon, self.sw.lat, self.ne.lon, self.ne.lat)
    }
}

impl FromStr for BoundingBox {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| RecordError::InvalidLocation(s.to_owned()))?;
        match values.as_slice() {
            [sw_lon, sw_lat, ne_lon, ne_lat] => Ok(BoundingBox {
                sw: Coordinates { lon: *sw_lon, lat: *sw_lat },
                ne: Coordinates { lon: *ne_lon, lat: *ne_lat },
            }),
            _ => Err(RecordError::InvalidLocation(s.to_owned())),
        }
    }
}

/// Parse a feed-formatted date, keeping the wall-clock time as written.
pub fn parse_feed_date(s: &str) -> Result<NaiveDateTime, RecordError> {
    DateTime::parse_from_str(s, FEED_DATE_FORMAT)
        .map(|dt| dt.naive_local())
        .map_err(|_| RecordError::InvalidDate(s.to_owned()))
}

/// One event of the feed
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    raw: String,
    parsed: Value,
    created_at_override: Option<NaiveDateTime>,
}

impl Record {
    /// Build a record from one line. The line must hold a JSON object with a
    /// `text` or `full_text` field.
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let raw = line.trim_end_matches(['\r', '\n']);
        let parsed: Value =
            serde_json::from_str(raw).map_err(|e| RecordError::InvalidJson(e.to_string()))?;
        match &parsed {
            Value::Object(map) if map.contains_key("text") || map.contains_key("full_text") => {
                Ok(Self {
                    raw: raw.to_owned(),
                    parsed,
                    created_at_override: None,
                })
            }
            _ => Err(RecordError::MissingText),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn json(&self) -> &Value {
        &self.parsed
    }

    pub fn id(&self) -> Option<u64> {
        self.parsed.get("id").and_then(Value::as_u64)
    }

    pub fn text(&self) -> &str {
        self.parsed
            .get("full_text")
            .or_else(|| self.parsed.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn user_id(&self) -> Option<u64> {
        self.parsed.pointer("/user/id").and_then(Value::as_u64)
    }

    pub fn screen_name(&self) -> Option<&str> {
        self.parsed.pointer("/user/screen_name").and_then(Value::as_str)
    }

    pub fn lang(&self) -> Option<&str> {
        self.parsed.get("lang").and_then(Value::as_str)
    }

    /// Creation time, or the value set by [`Record::set_created_at`]
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        self.created_at_override.or_else(|| self.orig_created_at())
    }

    /// Creation time as found in the raw line
    pub fn orig_created_at(&self) -> Option<NaiveDateTime> {
        self.parsed
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| parse_feed_date(s).ok())
    }

    /// Replace the creation time. The raw line is left untouched.
    pub fn set_created_at(&mut self, created_at: NaiveDateTime) {
        self.created_at_override = Some(created_at);
    }

    fn entities(&self, kind: &str) -> impl Iterator<Item = &Value> {
        self.parsed
            .pointer(&format!("/entities/{kind}"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
    }

    /// Lower-cased hashtags
    pub fn hashtags(&self) -> BTreeSet<String> {
        self.entities("hashtags")
            .filter_map(|h| h.get("text").and_then(Value::as_str))
            .map(str::to_lowercase)
            .collect()
    }

    pub fn urls(&self) -> BTreeSet<String> {
        self.entities("urls")
            .filter_map(|u| u.get("url").and_then(Value::as_str))
            .map(str::to_owned)
            .collect()
    }

    pub fn user_mentions(&self) -> BTreeSet<String> {
        self.entities("user_mentions")
            .filter_map(|m| m.get("screen_name").and_then(Value::as_str))
            .map(str::to_owned)
            .collect()
    }

    pub fn user_mention_ids(&self) -> BTreeSet<u64> {
        self.entities("user_mentions")
            .filter_map(|m| m.get("id").and_then(Value::as_u64))
            .collect()
    }

    /// The point the record was sent from, or the place box when there is none
    pub fn bounding_box(&self) -> Option<Vec<Coordinates>> {
        if let Some(point) = self.parsed.get("coordinates").filter(|c| !c.is_null()) {
            if point.get("type").and_then(Value::as_str) == Some("Point") {
                let c = as_coordinates(point.get("coordinates")?)?;
                return Some(vec![c; 4]);
            }
        }

        let corners = self
            .parsed
            .pointer("/place/bounding_box/coordinates/0")?
            .as_array()?
            .iter()
            .filter_map(as_coordinates)
            .collect::<Vec<_>>();
        (!corners.is_empty()).then_some(corners)
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        self.bounding_box().and_then(|b| b.first().copied())
    }

    fn has_point(&self) -> bool {
        self.parsed
            .pointer("/coordinates/type")
            .and_then(Value::as_str)
            == Some("Point")
    }

    pub fn permalink(&self) -> String {
        format!(
            "https://twitter.com/#!/{}/status/{}",
            self.screen_name().unwrap_or_default(),
            self.id().map(|id| id.to_string()).unwrap_or_default()
        )
    }

    /// The text with hashtags, urls and mentions cut out
    pub fn text_without_entities(&self) -> String {
        let mut chars: Vec<Option<char>> = self.text().chars().map(Some).collect();
        let spans = self
            .parsed
            .get("entities")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|entities| entities.values())
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(|e| {
                let indices = e.get("indices")?.as_array()?;
                Some((indices.first()?.as_u64()?, indices.get(1)?.as_u64()?))
            });
        for (start, end) in spans {
            let end = (end as usize).min(chars.len());
            for c in chars.iter_mut().take(end).skip(start as usize) {
                *c = None;
            }
        }
        chars.into_iter().flatten().collect()
    }

    /// Lower-cased words of at least three letters or digits, entities excluded.
    pub fn tokens(&self) -> Vec<String> {
        self.text_without_entities()
            .split_whitespace()
            .map(|t| {
                t.to_lowercase()
                    .chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
            })
            .filter(|t| t.chars().count() >= 3)
            .collect()
    }
}

fn as_coordinates(value: &Value) -> Option<Coordinates> {
    let pair = value.as_array()?;
    Some(Coordinates {
        lon: pair.first()?.as_f64()?,
        lat: pair.get(1)?.as_f64()?,
    })
}

impl Timestamped for Record {
    fn timestamp(&self) -> Option<NaiveDateTime> {
        self.created_at()
    }

    fn raw_line(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.screen_name().unwrap_or_default(), self.text())?;
        writeln!(f, "{}", self.permalink())?;
        if let Some(c) = self.coordinates() {
            writeln!(
                f,
                "http://www.openstreetmap.org/?mlat={}&mlon={}&zoom=6",
                c.lat, c.lon
            )?;
        }
        match self.created_at() {
            Some(created_at) => write!(f, "{created_at}"),
            None => Ok(()),
        }
    }
}

/// Matching rules in the shape of the feed's filter endpoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPredicates {
    pub follow: BTreeSet<u64>,
    pub track: BTreeSet<String>,
    pub locations: Vec<BoundingBox>,
    pub language: BTreeSet<String>,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
}

impl FilterPredicates {
    /// Whether the record passes the date window and language, and matches
    /// at least one follow, track or location term when any are given.
    pub fn matches(&self, record: &Record) -> bool {
        let created_at = record.created_at();
        if let (Some(start), Some(at)) = (self.start_date, created_at) {
            if at < start {
                return false;
            }
        }
        if let (Some(end), Some(at)) = (self.end_date, created_at) {
            if end < at {
                return false;
            }
        }

        let language_ok = self.language.is_empty()
            || record.lang().is_some_and(|l| self.language.contains(l));
        if !language_ok {
            return false;
        }

        if self.follow.is_empty() && self.track.is_empty() && self.locations.is_empty() {
            return true;
        }

        self.matches_follow(record) || self.matches_track(record) || self.matches_location(record)
    }

    fn matches_follow(&self, record: &Record) -> bool {
        record.user_id().is_some_and(|id| self.follow.contains(&id))
            || record
                .user_mention_ids()
                .iter()
                .any(|id| self.follow.contains(id))
    }

    fn matches_track(&self, record: &Record) -> bool {
        let text = record.text().to_lowercase();
        self.track.iter().any(|t| text.contains(&t.to_lowercase()))
    }

    fn matches_location(&self, record: &Record) -> bool {
        let Some(corners) = record.bounding_box() else {
            return false;
        };
        if record.has_point() {
            let point = corners[0];
            self.locations.iter().any(|b| b.contains(point))
        } else {
            let Some(place) = BoundingBox::enclosing(&corners) else {
                return false;
            };
            self.locations.iter().any(|b| b.intersects(&place))
        }
    }
}

impl BitOr for FilterPredicates {
    type Output = FilterPredicates;

    /// Union of the matching terms. Date windows are dropped.
    fn bitor(mut self, other: FilterPredicates) -> FilterPredicates {
        self.follow.extend(other.follow);
        self.track.extend(other.track);
        for location in other.locations {
            if !self.locations.contains(&location) {
                self.locations.push(location);
            }
        }
        self.language.extend(other.language);
        self.start_date = None;
        self.end_date = None;
        self
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::RECORDS;
    use super::*;
    use chrono::NaiveDate;

    fn records() -> Vec<Record> {
        RECORDS.iter().map(|l| Record::parse(l).unwrap()).collect()
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(matches!(
            Record::parse("not valid JSON"),
            Err(RecordError::InvalidJson(_))
        ));
        assert_eq!(Record::parse(r#"{"id": 1}"#), Err(RecordError::MissingText));
        assert_eq!(Record::parse("[1, 2]"), Err(RecordError::MissingText));
    }

    #[test]
    fn test_accessors() {
        let r = &records()[0];
        assert_eq!(r.id(), Some(190800262909276162));
        assert_eq!(r.user_id(), Some(10868922));
        assert_eq!(r.screen_name(), Some("dimazest"));
        assert_eq!(
            r.created_at(),
            NaiveDate::from_ymd_opt(2012, 4, 13).and_then(|d| d.and_hms_opt(13, 55, 2))
        );
        assert!(r.hashtags().contains("pp12"));
        assert!(r.raw().starts_with('{'));
    }

    #[test]
    fn test_tokens_skip_entities_and_short_words() {
        let r = &records()[1];
        assert_eq!(r.tokens(), vec!["come", "thats", "all", "the", "fun"]);
        assert!(!r.tokens().contains(&"pygrunn".to_string()));
    }

    #[test]
    fn test_coordinates() {
        let rs = records();
        assert_eq!(rs[0].coordinates(), None);
        assert_eq!(rs[1].coordinates(), Some(Coordinates { lon: 6.56, lat: 53.21 }));
        assert_eq!(rs[2].coordinates(), Some(Coordinates { lon: 4.7, lat: 52.3 }));
    }

    #[test]
    fn test_filter_follow_and_track() {
        let rs = records();
        let follow = FilterPredicates {
            follow: [10868922].into(),
            ..Default::default()
        };
        assert!(rs.iter().all(|r| follow.matches(r)));

        let track = FilterPredicates {
            track: ["PINKPOP".to_string()].into(),
            ..Default::default()
        };
        let matched: Vec<_> = rs.iter().filter(|r| track.matches(r)).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id(), Some(190800262909276162));

        let nobody = FilterPredicates {
            follow: [1].into(),
            ..Default::default()
        };
        assert!(!rs.iter().any(|r| nobody.matches(r)));
    }

    #[test]
    fn test_filter_locations_and_language() {
        let rs = records();
        let groningen = FilterPredicates {
            locations: vec!["6.0,53.0,7.0,54.0".parse().unwrap()],
            ..Default::default()
        };
        assert!(groningen.matches(&rs[1]));
        assert!(!groningen.matches(&rs[2]));

        let amsterdam = FilterPredicates {
            locations: vec!["4.8,52.35,4.9,52.38".parse().unwrap()],
            ..Default::default()
        };
        assert!(amsterdam.matches(&rs[2]));

        let dutch = FilterPredicates {
            language: ["nl".to_string()].into(),
            ..Default::default()
        };
        assert!(!dutch.matches(&rs[0]));
        assert!(dutch.matches(&rs[2]));
    }

    #[test]
    fn test_filter_date_window() {
        let rs = records();
        let april = FilterPredicates {
            start_date: Some(parse_feed_date("Sun Apr 01 00:00:00 +0000 2012").unwrap()),
            end_date: Some(parse_feed_date("Mon Apr 30 23:59:59 +0000 2012").unwrap()),
            ..Default::default()
        };
        let matched = rs.iter().filter(|r| april.matches(r)).count();
        assert_eq!(matched, 2);
    }

    #[test]
    fn test_union_of_predicates() {
        let a = FilterPredicates {
            follow: [1].into(),
            track: ["x".to_string()].into(),
            ..Default::default()
        };
        let b = FilterPredicates {
            follow: [2].into(),
            language: ["en".to_string()].into(),
            ..Default::default()
        };
        let union = a | b;
        assert_eq!(union.follow, BTreeSet::from([1, 2]));
        assert_eq!(union.track.len(), 1);
        assert_eq!(union.language.len(), 1);
    }

    #[test]
    fn test_bounding_box_parse() {
        let b: BoundingBox = "-0.5, 51.2, 0.3, 51.7".parse().unwrap();
        assert_eq!(b.to_param(), "-0.5,51.2,0.3,51.7");
        assert!("1,2,3".parse::<BoundingBox>().is_err());
    }
}
