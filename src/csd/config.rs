use crate::csd::launcher;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved, validated supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub mail_to: String,
    /// MTA argv; the message is written to its stdin.
    pub notifier: Vec<String>,
    pub max_failures: u32,
    pub reset_timer: Duration,
    pub lock_file: PathBuf,
    /// Roster order is launch order.
    pub workers: Vec<WorkerSpec>,
}

/// One camera after template substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    pub command: String,
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    supervisor: SupervisorSection,
    cameras: Vec<CameraEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorSection {
    mail_to: String,
    command_template: String,
    filename_template: String,
    max_failures: u32,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    reset_timer: Duration,
    #[serde(default = "default_notifier")]
    notifier: String,
    #[serde(default = "default_lock_file")]
    lock_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CameraEntry {
    name: String,
    stream: String,
    destination: PathBuf,
}

fn default_notifier() -> String {
    "/usr/lib/sendmail -t".to_string()
}

pub fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/run/camsrvd.pid")
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| D::Error::custom("duration must be a positive integer (seconds)")),
        serde_yaml::Value::String(s) => parse_duration_str(&s).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "duration must be an integer number of seconds or a string like \"30s\"",
        )),
    }
}

/// `"500ms"`, `"30s"`, `"2m"`, `"1h"`; a bare number means seconds.
pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map_or(t.len(), |(i, _)| i);
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| format!("invalid duration number: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "ms" => 0.001,
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3_600.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    Ok(Duration::from_millis((num * mult * 1000.0).round() as u64))
}

/// Wrap a substitution value in double quotes, escaping embedded quotes.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

/// Substitute every `{STREAM}` and `{DESTINATION}` in `template` with quoted values.
pub fn render_command(template: &str, stream: &str, destination: &str) -> String {
    template
        .replace("{STREAM}", &quote(stream))
        .replace("{DESTINATION}", &quote(destination))
}

fn resolve_destination(camera: &str, dir: &Path, filename_template: &str) -> anyhow::Result<String> {
    let canonical = std::fs::canonicalize(dir).map_err(|e| {
        anyhow::anyhow!(
            "camera {camera}: destination {} is not accessible: {e}",
            dir.display()
        )
    })?;
    anyhow::ensure!(
        canonical.is_dir(),
        "camera {camera}: destination {} is not a directory",
        canonical.display()
    );
    let joined = canonical.join(filename_template);
    joined.to_str().map(str::to_string).ok_or_else(|| {
        anyhow::anyhow!(
            "camera {camera}: destination {} is not valid UTF-8",
            joined.display()
        )
    })
}

pub fn load_config(config_path: &Path) -> anyhow::Result<SupervisorConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    parse_config(&raw)
        .map_err(|e| anyhow::anyhow!("invalid config {}: {e:#}", config_path.display()))
}

pub fn parse_config(raw: &str) -> anyhow::Result<SupervisorConfig> {
    let file_cfg: ConfigFile =
        serde_yaml::from_str(raw).map_err(|e| anyhow::anyhow!("failed to parse: {e}"))?;
    let sup = file_cfg.supervisor;

    let mail_to = sup.mail_to.trim().to_string();
    anyhow::ensure!(!mail_to.is_empty(), "supervisor.mail_to must not be empty");
    let command_template = sup.command_template.trim();
    anyhow::ensure!(
        !command_template.is_empty(),
        "supervisor.command_template must not be empty"
    );
    let filename_template = sup.filename_template.trim();
    anyhow::ensure!(
        !filename_template.is_empty(),
        "supervisor.filename_template must not be empty"
    );
    anyhow::ensure!(sup.max_failures > 0, "supervisor.max_failures must be > 0");
    anyhow::ensure!(
        !sup.reset_timer.is_zero(),
        "supervisor.reset_timer must be > 0"
    );

    let notifier = launcher::tokenize(&sup.notifier)
        .map_err(|e| anyhow::anyhow!("supervisor.notifier: {e}"))?;

    anyhow::ensure!(
        !file_cfg.cameras.is_empty(),
        "cameras: at least one camera must be configured"
    );

    let mut seen = BTreeSet::new();
    let mut workers = Vec::with_capacity(file_cfg.cameras.len());
    for cam in file_cfg.cameras {
        let name = cam.name.trim().to_string();
        anyhow::ensure!(!name.is_empty(), "cameras: camera name must not be empty");
        anyhow::ensure!(
            seen.insert(name.clone()),
            "cameras: duplicate camera name {name:?}"
        );
        let stream = cam.stream.trim();
        anyhow::ensure!(!stream.is_empty(), "camera {name}: stream must not be empty");

        let destination = resolve_destination(&name, &cam.destination, filename_template)?;
        let command = render_command(command_template, stream, &destination);
        launcher::tokenize(&command)
            .map_err(|e| anyhow::anyhow!("camera {name}: resolved command is unusable: {e}"))?;

        workers.push(WorkerSpec { name, command });
    }

    Ok(SupervisorConfig {
        mail_to,
        notifier,
        max_failures: sup.max_failures,
        reset_timer: sup.reset_timer,
        lock_file: sup.lock_file,
        workers,
    })
}
