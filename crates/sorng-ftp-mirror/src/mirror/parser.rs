//! LIST / MLSD response parser.
//!
//! Supports three formats:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **DOS/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//! 3. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//!
//! Every entry records the precision of its timestamp: Unix listings
//! only carry minutes for recent files and days for older ones, which is
//! what the granularity correction compensates for.

use crate::mirror::types::{EntryKind, RemoteEntry, TimestampPrecision};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref UNIX_RE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[+@.]?\s+   # permissions (+ optional ACL marker)
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (?:(\S+)\s+)?                        # group (absent on some servers)
        (\d+)\s+                             # size
        ([A-Za-z]{3})\s+(\d{1,2})\s+         # month day
        (\d{1,2}:\d{2}|\d{4})\s+             # time or year
        (.+)$                                # name (possibly with -> target)
        ",
    )
    .expect("static unix listing regex");
    static ref DOS_RE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-(?:\d{2}|\d{4}))\s+    # date
        (\d{1,2}:\d{2}(?:AM|PM)?)\s+         # time
        (<DIR>|\d+)\s+                       # size or <DIR>
        (.+)$                                # name
        ",
    )
    .expect("static dos listing regex");
}

/// Parse a full LIST or MLSD body.
pub fn parse_listing(raw: &str) -> Vec<RemoteEntry> {
    parse_listing_at(raw, Utc::now())
}

/// Parse with an explicit "now", used to place year-less Unix dates.
pub fn parse_listing_at(raw: &str, now: DateTime<Utc>) -> Vec<RemoteEntry> {
    raw.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .filter(|l| !is_total_line(l))
        .filter_map(|line| parse_line(line, now))
        .filter(|e| !e.is_self_reference())
        .collect()
}

fn is_total_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    parts.next() == Some("total")
        && parts.next().map_or(false, |n| n.bytes().all(|b| b.is_ascii_digit()))
        && parts.next().is_none()
}

fn parse_line(line: &str, now: DateTime<Utc>) -> Option<RemoteEntry> {
    if line.contains(';') && line.contains('=') {
        if let Some(e) = parse_mlsd(line.trim_start()) {
            return Some(e);
        }
    }
    if let Some(e) = parse_unix(line.trim_start(), now) {
        return Some(e);
    }
    if let Some(e) = parse_dos(line.trim_start()) {
        return Some(e);
    }

    log::debug!("unrecognised listing line, keeping as untyped entry: {}", line);
    let mut entry = RemoteEntry::file(line.trim(), 0, None);
    entry.kind = EntryKind::Unknown;
    entry.raw = Some(line.to_string());
    Some(entry)
}

// ─── MLSD ────────────────────────────────────────────────────────────

/// `fact1=val1;fact2=val2; filename`
fn parse_mlsd(line: &str) -> Option<RemoteEntry> {
    let (facts_str, name) = line.split_once("; ")?;
    if name.is_empty() {
        return None;
    }

    let facts: HashMap<String, String> = facts_str
        .split(';')
        .filter_map(|seg| seg.trim().split_once('='))
        .map(|(k, v)| (k.to_lowercase(), v.to_string()))
        .collect();

    let type_fact = facts.get("type").map(|s| s.to_lowercase());
    let (kind, link_target) = match type_fact.as_deref() {
        Some("dir") | Some("cdir") | Some("pdir") => (EntryKind::Directory, None),
        Some("file") => (EntryKind::File, None),
        Some(t) if t.starts_with("os.unix=slink") || t.starts_with("os.unix=symlink") => {
            let target = facts
                .get("type")
                .and_then(|raw| raw.split_once(':'))
                .map(|(_, t)| t.to_string());
            (EntryKind::Symlink, target)
        }
        _ => (EntryKind::Unknown, None),
    };

    let size = facts
        .get("size")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let modified = facts.get("modify").and_then(|v| parse_mlsd_time(v));

    Some(RemoteEntry {
        name: name.to_string(),
        kind,
        size,
        modified,
        precision: modified.map(|_| TimestampPrecision::Second),
        link_target,
        raw: Some(line.to_string()),
        facts,
    })
}

/// `YYYYMMDDHHmmSS[.fraction]`, always UTC.
fn parse_mlsd_time(s: &str) -> Option<DateTime<Utc>> {
    let base = s.get(..14)?;
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

// ─── Unix ────────────────────────────────────────────────────────────

fn parse_unix(line: &str, now: DateTime<Utc>) -> Option<RemoteEntry> {
    let caps = UNIX_RE.captures(line)?;

    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().unwrap_or(0);
    let month = caps.get(6)?.as_str();
    let day = caps.get(7)?.as_str().parse::<u32>().ok()?;
    let time_or_year = caps.get(8)?.as_str();
    let name_raw = caps.get(9)?.as_str();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => EntryKind::Directory,
        Some(b'l') => EntryKind::Symlink,
        Some(b'-') => EntryKind::File,
        _ => EntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_raw.split_once(" -> ")) {
        (EntryKind::Symlink, Some((n, t))) => (n.to_string(), Some(t.to_string())),
        _ => (name_raw.to_string(), None),
    };

    let (modified, precision) = parse_unix_date(month, day, time_or_year, now)?;

    let mut facts = HashMap::new();
    facts.insert("unix.mode".to_string(), perms.to_string());
    if let Some(owner) = caps.get(3) {
        facts.insert("unix.owner".to_string(), owner.as_str().to_string());
    }
    if let Some(group) = caps.get(4) {
        facts.insert("unix.group".to_string(), group.as_str().to_string());
    }

    Some(RemoteEntry {
        name,
        kind,
        size,
        modified: Some(modified),
        precision: Some(precision),
        link_target,
        raw: Some(line.to_string()),
        facts,
    })
}

/// `Jan  1 12:00` (recent, year implied) or `Jan  1  2025`.
fn parse_unix_date(
    month: &str,
    day: u32,
    time_or_year: &str,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, TimestampPrecision)> {
    let month = month.parse::<chrono::Month>().ok()?.number_from_month();

    if let Some((h, m)) = time_or_year.split_once(':') {
        let (h, m) = (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?);
        let at = |year: i32| {
            NaiveDate::from_ymd_opt(year, month, day)
                .and_then(|d| d.and_hms_opt(h, m, 0))
                .map(|dt| Utc.from_utc_datetime(&dt))
        };
        // Year-less dates lie within the last six months; anything more
        // than a day ahead belongs to last year.
        let this_year = at(now.year());
        let stamp = match this_year {
            Some(t) if t <= now + Duration::days(1) => t,
            _ => at(now.year() - 1)?,
        };
        return Some((stamp, TimestampPrecision::Minute));
    }

    let year = time_or_year.parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some((
        Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?),
        TimestampPrecision::Day,
    ))
}

// ─── DOS / IIS ───────────────────────────────────────────────────────

fn parse_dos(line: &str) -> Option<RemoteEntry> {
    let caps = DOS_RE.captures(line)?;

    let date_str = caps.get(1)?.as_str();
    let time_str = caps.get(2)?.as_str();
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str().to_string();

    let (kind, size) = if size_or_dir == "<DIR>" {
        (EntryKind::Directory, 0)
    } else {
        (EntryKind::File, size_or_dir.parse::<u64>().unwrap_or(0))
    };
    let modified = parse_dos_date(date_str, time_str);

    Some(RemoteEntry {
        name,
        kind,
        size,
        modified,
        precision: modified.map(|_| TimestampPrecision::Minute),
        link_target: None,
        raw: Some(line.to_string()),
        facts: HashMap::new(),
    })
}

fn parse_dos_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let combined = format!("{} {}", date, time);
    ["%m-%d-%y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %I:%M%p", "%m-%d-%Y %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&combined, fmt).ok())
        .map(|dt| Utc.from_utc_datetime(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap()
    }

    #[test]
    fn unix_file_recent_has_minute_precision() {
        let entries = parse_listing_at("-rw-r--r--   1 user group  1234 Jan  1 12:00 readme.txt", now());
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.name, "readme.txt");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 1234);
        assert_eq!(e.precision, Some(TimestampPrecision::Minute));
        assert_eq!(e.modified, Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()));
    }

    #[test]
    fn unix_recent_date_in_future_rolls_back_a_year() {
        let entries = parse_listing_at("-rw-r--r-- 1 u g 5 Dec 24 18:30 gift.txt", now());
        assert_eq!(entries[0].modified, Some(Utc.with_ymd_and_hms(2025, 12, 24, 18, 30, 0).unwrap()));
    }

    #[test]
    fn unix_old_file_has_day_precision() {
        let entries = parse_listing_at("-rw-r--r-- 1 u g 5 Jun  3  2019 old.tar", now());
        assert_eq!(entries[0].precision, Some(TimestampPrecision::Day));
        assert_eq!(entries[0].modified, Some(Utc.with_ymd_and_hms(2019, 6, 3, 0, 0, 0).unwrap()));
    }

    #[test]
    fn unix_symlink_and_missing_group() {
        let raw = "lrwxrwxrwx   1 root    22 Jan  5 08:00 link -> /var/target\n\
                   drwxr-xr-x   2 root root  4096 Mar  1 09:30 sub dir";
        let entries = parse_listing_at(raw, now());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Symlink);
        assert_eq!(entries[0].name, "link");
        assert_eq!(entries[0].link_target.as_deref(), Some("/var/target"));
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[1].name, "sub dir");
    }

    #[test]
    fn total_and_dot_entries_are_dropped() {
        let raw = "total 8\n\
                   drwxr-xr-x 2 u g 4096 Jan 1 12:00 .\n\
                   drwxr-xr-x 2 u g 4096 Jan 1 12:00 ..\n\
                   -rw-r--r-- 1 u g 10 Jan 1 12:00 real.txt";
        let entries = parse_listing_at(raw, now());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "real.txt");
    }

    #[test]
    fn mlsd_facts_and_symlink_target() {
        let raw = "type=file;size=1024;modify=20260101120000; example.bin\n\
                   type=OS.unix=slink:/srv/data;modify=20260101120000; data\n\
                   type=cdir;modify=20260101120000; .";
        let entries = parse_listing_at(raw, now());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, 1024);
        assert_eq!(entries[0].precision, Some(TimestampPrecision::Second));
        assert_eq!(entries[1].kind, EntryKind::Symlink);
        assert_eq!(entries[1].link_target.as_deref(), Some("/srv/data"));
    }

    #[test]
    fn mlsd_current_and_parent_dirs_are_dropped() {
        let raw = "type=cdir;modify=20260101120000;perm=el; /srv/www\n\
                   type=pdir;modify=20260101120000;perm=el; /srv\n\
                   type=Cdir;modify=20260101120000; www\n\
                   type=file;size=3;modify=20260101120000; a.txt";
        let entries = parse_listing_at(raw, now());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
    }

    #[test]
    fn dos_directory_and_file() {
        let raw = "01-01-26  12:00AM      <DIR> My Documents\n\
                   02-14-26  03:15PM        512 notes.txt";
        let entries = parse_listing_at(raw, now());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].name, "My Documents");
        assert_eq!(entries[1].size, 512);
        assert_eq!(entries[1].modified, Some(Utc.with_ymd_and_hms(2026, 2, 14, 15, 15, 0).unwrap()));
    }
}
