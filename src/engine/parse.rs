//! Parsers for the tab-separated `--format` output the engine CLI prints.

use crate::error::AppError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Name,
    /// Longest running first.
    Uptime,
}

impl FromStr for SortKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "name" => Ok(SortKey::Name),
            "uptime" => Ok(SortKey::Uptime),
            _ => Err(anyhow::anyhow!("Invalid sort key: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub cpu: String,
    pub memory: String,
    pub memory_percent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRow {
    pub name: String,
    pub status: String,
    pub running: bool,
    /// -1 when the container is not up.
    pub uptime_seconds: i64,
    pub ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ContainerStats>,
}

fn non_empty_lines(out: &str) -> impl Iterator<Item = &str> {
    out.lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.trim().is_empty())
}

pub fn is_running_status(status: &str) -> bool {
    let lower = status.trim().to_lowercase();
    lower.starts_with("up") || lower.starts_with("restarting")
}

fn uptime_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+)\s*(second|minute|hour|day|week|month|year)").expect("static regex")
    })
}

/// Seconds a container has been up according to its `Up ...` status text.
pub fn parse_uptime_seconds(status: &str) -> i64 {
    let lower = status.trim().to_lowercase();
    if !lower.starts_with("up") {
        return -1;
    }
    if let Some(caps) = uptime_regex().captures(&lower) {
        let amount: i64 = caps[1].parse().unwrap_or(0);
        let unit = match &caps[2] {
            "second" => 1,
            "minute" => 60,
            "hour" => 3_600,
            "day" => 86_400,
            "week" => 604_800,
            "month" => 2_628_000,
            "year" => 31_536_000,
            _ => 1,
        };
        return amount.saturating_mul(unit);
    }
    if lower.contains("an hour") {
        3_600
    } else if lower.contains("a minute") {
        60
    } else if lower.contains("a day") {
        86_400
    } else if lower.contains("a week") {
        604_800
    } else {
        0
    }
}

fn published_port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:[0-9.:\[\]]+)?:(\d+)->").expect("static regex"))
}

/// Host ports from a `Ports` column such as `0.0.0.0:8080->80/tcp, :::8080->80/tcp`.
pub fn parse_published_ports(text: &str) -> Vec<u16> {
    let mut seen = HashSet::new();
    published_port_regex()
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse::<u16>().ok())
        .filter(|port| seen.insert(*port))
        .collect()
}

pub fn parse_container_list(out: &str) -> Vec<ContainerRow> {
    non_empty_lines(out)
        .map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next().unwrap_or_default().trim().to_string();
            let status = fields.next().unwrap_or_default().trim().to_string();
            let ports_raw = fields.next().unwrap_or_default();
            ContainerRow {
                running: is_running_status(&status),
                uptime_seconds: parse_uptime_seconds(&status),
                ports: parse_published_ports(ports_raw),
                name,
                status,
                stats: None,
            }
        })
        .filter(|row| !row.name.is_empty())
        .collect()
}

pub fn sort_rows(rows: &mut [ContainerRow], key: SortKey) {
    match key {
        SortKey::Name => rows.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        }),
        SortKey::Uptime => rows.sort_by(|a, b| b.uptime_seconds.cmp(&a.uptime_seconds)),
    }
}

/// Case-insensitive substring match on the container name.
pub fn filter_rows(rows: Vec<ContainerRow>, search: &str) -> Vec<ContainerRow> {
    let query = search.trim().to_lowercase();
    if query.is_empty() {
        return rows;
    }
    rows.into_iter()
        .filter(|row| row.name.to_lowercase().contains(&query))
        .collect()
}

/// Maps full IDs, short IDs and every name variant to the display name.
pub fn build_name_index(ids_out: &str) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for line in non_empty_lines(ids_out) {
        let mut fields = line.split('\t');
        let id = fields.next().unwrap_or_default().trim();
        let display = fields.next().unwrap_or_default().trim();
        if id.is_empty() || display.is_empty() {
            continue;
        }
        index.insert(id.to_string(), display.to_string());
        let short: String = id.chars().take(12).collect();
        if short.chars().count() == 12 && short != id {
            index.insert(short, display.to_string());
        }
        for part in display.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            index.insert(part.to_string(), display.to_string());
            let clean = part.trim_start_matches('/');
            if !clean.is_empty() && clean != part {
                index.insert(clean.to_string(), display.to_string());
            }
        }
    }
    index
}

fn resolve_name<'a>(index: &'a HashMap<String, String>, cid: &str) -> Option<&'a String> {
    let clean = cid.trim_start_matches('/');
    let prefix = |s: &str| s.chars().take(12).collect::<String>();
    index
        .get(cid)
        .or_else(|| index.get(clean))
        .or_else(|| index.get(&prefix(clean)))
        .or_else(|| index.get(&prefix(cid)))
}

/// Stats keyed by display name. Rows that cannot be mapped back are skipped.
pub fn parse_stats(stats_out: &str, index: &HashMap<String, String>) -> HashMap<String, ContainerStats> {
    let mut stats = HashMap::new();
    for line in non_empty_lines(stats_out) {
        let fields: Vec<&str> = line.split('\t').collect();
        let cid = fields.first().copied().unwrap_or_default().trim();
        if cid.is_empty() {
            continue;
        }
        let Some(name) = resolve_name(index, cid) else {
            continue;
        };
        let mem_used = fields
            .get(2)
            .and_then(|usage| usage.split(" / ").next())
            .unwrap_or_default();
        stats.insert(
            name.clone(),
            ContainerStats {
                cpu: round_percent(fields.get(1).copied().unwrap_or_default()),
                memory: round_mem_usage(mem_used),
                memory_percent: round_percent(fields.get(3).copied().unwrap_or_default()),
            },
        );
    }
    stats
}

fn mem_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([\d.]+)\s*([A-Za-z]+)").expect("static regex"))
}

/// `"512MiB"` -> `"537 MB"`. Unparseable input is returned unchanged.
pub fn round_mem_usage(mem: &str) -> String {
    let mem = mem.trim();
    if mem.is_empty() {
        return "N/A".to_string();
    }
    let Some(caps) = mem_regex().captures(mem) else {
        return mem.to_string();
    };
    let Ok(n) = caps[1].parse::<f64>() else {
        return mem.to_string();
    };
    let mb = match caps[2].to_uppercase().as_str() {
        "B" => n / 1e6,
        "KB" => n / 1e3,
        "KIB" => n * 1024.0 / 1e6,
        "MB" => n,
        "MIB" => n * 1_048_576.0 / 1e6,
        "GB" => n * 1e3,
        "GIB" => n * 1_073_741_824.0 / 1e6,
        _ => n,
    };
    format!("{} MB", mb.round() as i64)
}

pub fn round_percent(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return "N/A".to_string();
    }
    match value.strip_suffix('%').map(|n| n.trim().parse::<f64>()) {
        Some(Ok(n)) => format!("{}%", n.round() as i64),
        _ => value.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRow {
    /// `(dangling)` for untagged images.
    pub reference: String,
    pub dangling: bool,
    pub id: String,
    pub short_id: String,
    pub size: String,
    pub created: String,
}

const DANGLING_REFERENCE: &str = "(dangling)";

pub fn short_image_id(id: &str) -> String {
    let plain = id.trim_start_matches("sha256:");
    let short: String = plain.chars().take(12).collect();
    if short.is_empty() {
        id.to_string()
    } else {
        short
    }
}

/// Every reference form (repo:tag, full ID, bare ID, short ID) used by a container.
pub fn parse_image_usage(usage_out: &str) -> HashSet<String> {
    let mut used = HashSet::new();
    for line in non_empty_lines(usage_out) {
        let mut fields = line.split('\t');
        let image_ref = fields.next().unwrap_or_default().trim();
        let raw_id = fields.next().unwrap_or_default().trim();
        if !image_ref.is_empty() {
            used.insert(image_ref.to_string());
        }
        if raw_id.is_empty() {
            continue;
        }
        used.insert(raw_id.to_string());
        let trimmed = raw_id.trim_start_matches("sha256:");
        if !trimmed.is_empty() {
            used.insert(trimmed.to_string());
            used.insert(trimmed.chars().take(12).collect());
        }
    }
    used
}

/// Images no container references in any form.
pub fn removable_images(images_out: &str, used: &HashSet<String>) -> Vec<ImageRow> {
    non_empty_lines(images_out)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
            let reference = fields.first().copied().unwrap_or_default();
            let id = fields.get(1).copied().unwrap_or_default();
            if id.is_empty() || used.contains(id) {
                return None;
            }
            let plain = id.trim_start_matches("sha256:");
            if !plain.is_empty() {
                let short: String = plain.chars().take(12).collect();
                if used.contains(plain) || used.contains(&short) {
                    return None;
                }
            }
            if !reference.is_empty() && used.contains(reference) {
                return None;
            }
            let dangling = reference.is_empty() || reference == "<none>:<none>";
            Some(ImageRow {
                reference: if dangling { DANGLING_REFERENCE.to_string() } else { reference.to_string() },
                dangling,
                id: id.to_string(),
                short_id: short_image_id(id),
                size: fields.get(2).filter(|s| !s.is_empty()).unwrap_or(&"n/a").to_string(),
                created: fields.get(3).filter(|s| !s.is_empty()).unwrap_or(&"n/a").to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub name: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub container_port: String,
    /// `None` when the port is exposed but not published.
    pub host_bindings: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerDetails {
    pub image: Option<String>,
    pub state: String,
    pub mounts: Vec<MountInfo>,
    pub networks: Vec<NetworkInfo>,
    pub ports: Vec<PortInfo>,
    pub env: Vec<EnvVar>,
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Accepts either the array `inspect` prints or a single object.
pub fn parse_inspect(out: &str) -> Result<ContainerDetails, AppError> {
    let parsed: Value = serde_json::from_str(out.trim())
        .map_err(|e| AppError::ParseError(format!("inspect output is not JSON: {}", e)))?;
    let obj = match parsed {
        Value::Array(items) => items
            .into_iter()
            .next()
            .unwrap_or_else(|| Value::Object(Default::default())),
        obj @ Value::Object(_) => obj,
        other => return Err(AppError::ParseError(format!("unexpected inspect output: {}", other))),
    };

    let state = str_at(&obj, &["State", "Status"])
        .or_else(|| str_at(&obj, &["State", "Health", "Status"]))
        .unwrap_or("unknown")
        .to_string();

    let mounts = obj
        .get("Mounts")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|m| MountInfo {
                    source: text_of(m.get("Source")),
                    destination: text_of(m.get("Destination")),
                    mount_type: text_of(m.get("Type")),
                })
                .collect()
        })
        .unwrap_or_default();

    let networks = obj
        .pointer("/NetworkSettings/Networks")
        .and_then(Value::as_object)
        .map(|nets| {
            nets.iter()
                .map(|(name, v)| NetworkInfo {
                    name: name.clone(),
                    ip_address: text_of(v.get("IPAddress")),
                })
                .collect()
        })
        .unwrap_or_default();

    let ports = obj
        .pointer("/NetworkSettings/Ports")
        .and_then(Value::as_object)
        .map(|ports| {
            ports
                .iter()
                .map(|(port, bindings)| PortInfo {
                    container_port: port.clone(),
                    host_bindings: bindings.as_array().map(|arr| {
                        arr.iter()
                            .map(|b| {
                                let ip = str_at(b, &["HostIp"]).unwrap_or("0.0.0.0");
                                format!("{}:{}", ip, text_of(b.get("HostPort")))
                            })
                            .collect()
                    }),
                })
                .collect()
        })
        .unwrap_or_default();

    let env = obj
        .pointer("/Config/Env")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    let text = text_of(Some(item));
                    let (key, value) = text.split_once('=').unwrap_or((text.as_str(), ""));
                    EnvVar {
                        key: key.to_string(),
                        value: value.to_string(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ContainerDetails {
        image: str_at(&obj, &["Config", "Image"]).map(str::to_string),
        state,
        mounts,
        networks,
        ports,
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_understands_engine_phrases() {
        assert_eq!(parse_uptime_seconds("Up 5 minutes"), 300);
        assert_eq!(parse_uptime_seconds("Up 2 hours (healthy)"), 7_200);
        assert_eq!(parse_uptime_seconds("Up 3 months"), 7_884_000);
        assert_eq!(parse_uptime_seconds("Up About an hour"), 3_600);
        assert_eq!(parse_uptime_seconds("Up About a minute"), 60);
        assert_eq!(parse_uptime_seconds("Up Less than a second"), 0);
        assert_eq!(parse_uptime_seconds("Exited (0) 3 days ago"), -1);
        assert_eq!(parse_uptime_seconds(""), -1);
    }

    #[test]
    fn running_includes_restarting() {
        assert!(is_running_status("Up 2 days"));
        assert!(is_running_status("Restarting (1) 5 seconds ago"));
        assert!(!is_running_status("Exited (137) 2 hours ago"));
        assert!(!is_running_status("Created"));
    }

    #[test]
    fn published_ports_are_deduplicated() {
        let ports = parse_published_ports("0.0.0.0:8080->80/tcp, :::8080->80/tcp, 0.0.0.0:8443->443/tcp, 9000/tcp");
        assert_eq!(ports, vec![8080, 8443]);
        assert!(parse_published_ports("").is_empty());
    }

    #[test]
    fn container_list_sorts_and_filters() {
        let out = "web\tUp 2 hours\t0.0.0.0:8080->80/tcp\ndb\tUp 3 days\t\ncache\tExited (0) 1 hour ago\t\n\n";
        let mut rows = parse_container_list(out);
        assert_eq!(rows.len(), 3);
        assert!(rows[0].running);
        assert_eq!(rows[0].ports, vec![8080]);
        assert!(!rows[2].running);

        sort_rows(&mut rows, SortKey::Name);
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["cache", "db", "web"]);

        let mut mixed = parse_container_list("Web\tUp 1 hour\t\napi\tUp 1 hour\t\ndb\tUp 1 hour\t\nweb\tUp 1 hour\t\n");
        sort_rows(&mut mixed, SortKey::Name);
        let names: Vec<_> = mixed.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["api", "db", "Web", "web"]);

        sort_rows(&mut rows, SortKey::Uptime);
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web", "cache"]);

        let filtered = filter_rows(rows, "  WE ");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "web");
    }

    #[test]
    fn stats_join_through_id_and_name_variants() {
        let ids = "0123456789abcdef0123\tweb\nfedcba9876543210\t/db,db-alias\n";
        let index = build_name_index(ids);
        assert_eq!(index.get("0123456789ab").map(String::as_str), Some("web"));
        assert_eq!(index.get("db").map(String::as_str), Some("/db,db-alias"));

        let stats_out = "0123456789ab\t1.56%\t512MiB / 1.944GiB\t25.72%\n/db-alias\t0.00%\t1.5GiB / 4GiB\t37.5%\nunknown\t9%\t1MiB / 1GiB\t0.1%\n";
        let stats = parse_stats(stats_out, &index);
        assert_eq!(stats.len(), 2);
        let web = &stats["web"];
        assert_eq!(web.cpu, "2%");
        assert_eq!(web.memory, "537 MB");
        assert_eq!(web.memory_percent, "26%");
        assert_eq!(stats["/db,db-alias"].memory, "1611 MB");
    }

    #[test]
    fn name_index_tolerates_multibyte_ids() {
        let index = build_name_index("ééééééééééééé\tweb\nabc\tdb\n");
        assert_eq!(index.get("éééééééééééé").map(String::as_str), Some("web"));
        assert_eq!(index.get("abc").map(String::as_str), Some("db"));
    }

    #[test]
    fn memory_rounding_covers_units() {
        assert_eq!(round_mem_usage("1500kB"), "2 MB");
        assert_eq!(round_mem_usage("2GB"), "2000 MB");
        assert_eq!(round_mem_usage("800B"), "0 MB");
        assert_eq!(round_mem_usage(""), "N/A");
        assert_eq!(round_mem_usage("--"), "--");
        assert_eq!(round_percent("12.5%"), "13%");
        assert_eq!(round_percent("n/a"), "n/a");
    }

    #[test]
    fn only_unused_images_are_removable() {
        let usage = "nginx:latest\tsha256:aaaaaaaaaaaa1111\nredis:7\tbbbbbbbbbbbb2222\n";
        let used = parse_image_usage(usage);
        let images = "nginx:latest\tsha256:aaaaaaaaaaaa1111\t187MB\t2 weeks ago\n\
                      redis:7\tsha256:bbbbbbbbbbbb2222\t130MB\t3 weeks ago\n\
                      alpine:3.19\tsha256:cccccccccccc3333\t7MB\t\n";
        let removable = removable_images(images, &used);
        assert_eq!(removable.len(), 1);
        assert_eq!(removable[0].reference, "alpine:3.19");
        assert_eq!(removable[0].short_id, "cccccccccccc");
        assert_eq!(removable[0].created, "n/a");
        assert!(!removable[0].dangling);
    }

    #[test]
    fn untagged_images_are_labelled_dangling() {
        let images = "<none>:<none>\tsha256:dddddddddddd4444\t5MB\t1 day ago\n\tsha256:eeeeeeeeeeee5555\t1MB\t\n";
        let removable = removable_images(images, &HashSet::new());
        assert_eq!(removable.len(), 2);
        for row in &removable {
            assert!(row.dangling);
            assert_eq!(row.reference, "(dangling)");
        }
        assert_eq!(removable[0].id, "sha256:dddddddddddd4444");
    }

    #[test]
    fn inspect_summary_handles_array_output() {
        let out = r#"[{
            "Config": {"Image": "nginx:latest", "Env": ["PATH=/usr/bin", "OPTS=a=b", "EMPTY"]},
            "State": {"Status": "running"},
            "Mounts": [{"Source": "/srv/www", "Destination": "/usr/share/nginx/html", "Type": "bind"}],
            "NetworkSettings": {
                "Networks": {"bridge": {"IPAddress": "172.17.0.2"}},
                "Ports": {"80/tcp": [{"HostIp": "", "HostPort": "8080"}], "443/tcp": null}
            }
        }]"#;
        let details = parse_inspect(out).unwrap();
        assert_eq!(details.image.as_deref(), Some("nginx:latest"));
        assert_eq!(details.state, "running");
        assert_eq!(details.mounts[0].mount_type, "bind");
        assert_eq!(details.networks[0].ip_address, "172.17.0.2");
        let http = details.ports.iter().find(|p| p.container_port == "80/tcp").unwrap();
        assert_eq!(http.host_bindings.as_deref(), Some(&["0.0.0.0:8080".to_string()][..]));
        let https = details.ports.iter().find(|p| p.container_port == "443/tcp").unwrap();
        assert!(https.host_bindings.is_none());
        assert_eq!(details.env[1], EnvVar { key: "OPTS".into(), value: "a=b".into() });
        assert_eq!(details.env[2].value, "");
    }

    #[test]
    fn inspect_falls_back_to_health_and_unknown_state() {
        let health = parse_inspect(r#"{"State": {"Health": {"Status": "starting"}}}"#).unwrap();
        assert_eq!(health.state, "starting");
        let empty = parse_inspect("[]").unwrap();
        assert_eq!(empty.state, "unknown");
        assert!(empty.image.is_none());
        assert!(matches!(parse_inspect("not json"), Err(AppError::ParseError(_))));
    }
}
