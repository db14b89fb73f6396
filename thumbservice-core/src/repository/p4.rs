//! Adapter that shells out to the `p4` command line client.
//!
//! Tagged output (`p4 -ztag`) is parsed into key/value records. The change
//! cursor is kept in the server counter `p4td-<client>`, holding the next
//! change number to examine, so a restarted daemon resumes where it stopped.
//! A configured `firstChange` replaces the counter as the starting point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use thumbservice_config::{ConnectionConfig, FinalChange};
use tokio::process::Command;
use tracing::{debug, warn};

use super::RepositoryClient;
use crate::error::AdapterError;
use crate::events::ChangeEvent;

const COUNTER_PREFIX: &str = "p4td-";
const UNKNOWN_CLIENT: &str = "*unknown*";
const FSTAT_FIELDS: &str = "depotFile,headRev,headType,headAction,fileSize";

/// One `-ztag` record.
pub(crate) type TaggedRecord = HashMap<String, String>;

#[derive(Debug)]
pub struct P4CommandClient {
    executable: PathBuf,
    port: Option<String>,
    user: Option<String>,
    client: String,
    first_change: Option<u64>,
    final_change: Option<FinalChange>,
    cursor: Mutex<Cursor>,
}

#[derive(Debug, Default)]
struct Cursor {
    /// Next change number to examine; `None` until the first listing.
    next: Option<u64>,
    /// Last change to examine, resolved together with `next`.
    last: Option<u64>,
    exhausted: bool,
}

struct CommandOutput {
    success: bool,
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: String,
}

impl CommandOutput {
    fn no_such_file(&self) -> bool {
        self.stderr.contains("no such file")
    }

    fn check(self, args: &[&str]) -> Result<Self, AdapterError> {
        if self.success {
            Ok(self)
        } else {
            Err(AdapterError::Command {
                command: format!("p4 {}", args.join(" ")),
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

impl P4CommandClient {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            executable: config.p4_executable.clone(),
            port: config.port.clone(),
            user: config.user.clone(),
            client: config.client.clone(),
            first_change: config.first_change,
            final_change: config.final_change,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    pub fn counter_name(&self) -> String {
        format!("{COUNTER_PREFIX}{}", self.client)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.executable);
        if let Some(port) = &self.port {
            command.arg("-p").arg(port);
        }
        if let Some(user) = &self.user {
            command.arg("-u").arg(user);
        }
        command
            .arg("-c")
            .arg(&self.client)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput, AdapterError> {
        debug!("p4 {}", args.join(" "));
        let output = self.command(args).output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run_tagged(
        &self,
        args: &[&str],
    ) -> Result<Vec<TaggedRecord>, AdapterError> {
        let mut tagged = Vec::with_capacity(args.len() + 1);
        tagged.push("-ztag");
        tagged.extend_from_slice(args);
        let output = self.run(&tagged).await?.check(&tagged)?;
        Ok(parse_tagged(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn read_counter(&self) -> Result<u64, AdapterError> {
        let name = self.counter_name();
        let args = ["counter", name.as_str()];
        let output = self.run(&args).await?.check(&args)?;
        let text = String::from_utf8_lossy(&output.stdout);
        let value = text.trim();
        value.parse().map_err(|_| {
            AdapterError::Protocol(format!("counter {name} holds {value:?}"))
        })
    }

    async fn write_counter(&self, value: u64) -> Result<(), AdapterError> {
        let name = self.counter_name();
        let value = value.to_string();
        let args = ["counter", name.as_str(), value.as_str()];
        self.run(&args).await?.check(&args)?;
        Ok(())
    }

    /// Where to start on the first poll: `firstChange` when configured,
    /// otherwise the persisted counter. Never below change 1.
    async fn starting_change(&self) -> Result<u64, AdapterError> {
        let start = match self.first_change {
            Some(first) => first,
            None => {
                let counter = self.read_counter().await?;
                debug!(counter, "read change counter {}", self.counter_name());
                counter
            }
        };
        Ok(start.max(1))
    }

    /// Highest submitted change visible to the client, 0 if there is none.
    async fn head_change(&self) -> Result<u64, AdapterError> {
        let files = format!("//{}/...", self.client);
        let records = self
            .run_tagged(&["changes", "-m", "1", "-s", "submitted", &files])
            .await?;
        Ok(change_numbers(&records)?.into_iter().max().unwrap_or(0))
    }

    async fn last_change(&self) -> Result<Option<u64>, AdapterError> {
        match self.final_change {
            None => Ok(None),
            Some(FinalChange::Change(last)) => Ok(Some(last)),
            Some(FinalChange::Head) => {
                let head = self.head_change().await?;
                debug!(head, "range ends at the head change");
                Ok(Some(head))
            }
        }
    }

    async fn submitted_changes(
        &self,
        next: u64,
        upper: Option<u64>,
    ) -> Result<Vec<u64>, AdapterError> {
        let range = format!("//{}/...@{next},#head", self.client);
        let records = self
            .run_tagged(&["changes", "-s", "submitted", &range])
            .await?;
        let mut changes = change_numbers(&records)?;
        changes.retain(|change| {
            *change >= next && upper.is_none_or(|last| *change <= last)
        });
        changes.sort_unstable();
        changes.dedup();
        Ok(changes)
    }

    async fn fstat_at(
        &self,
        path: &str,
        revision: u32,
        extra: &[&str],
    ) -> Result<CommandOutput, AdapterError> {
        let spec = format!("{path}#{revision}");
        let mut args = vec!["-ztag", "fstat"];
        args.extend_from_slice(extra);
        args.push(spec.as_str());
        let output = self.run(&args).await?;
        if output.no_such_file() {
            return Err(AdapterError::StaleRevision {
                path: path.to_string(),
                revision,
            });
        }
        output.check(&args)
    }

    async fn run_attribute(
        &self,
        path: &str,
        revision: u32,
        args: &[&str],
    ) -> Result<(), AdapterError> {
        let spec = format!("{path}#{revision}");
        let mut args = args.to_vec();
        args.push(spec.as_str());
        let output = self.run(&args).await?;
        if output.no_such_file() {
            return Err(AdapterError::StaleRevision {
                path: path.to_string(),
                revision,
            });
        }
        output.check(&args)?;
        Ok(())
    }

    async fn files_in_change(
        &self,
        change: u64,
    ) -> Result<Vec<ChangeEvent>, AdapterError> {
        let spec = format!("//{}/...@={change}", self.client);
        let args =
            ["-ztag", "fstat", "-Ol", "-T", FSTAT_FIELDS, spec.as_str()];
        let output = self.run(&args).await?;
        if output.no_such_file() {
            // Nothing from this change is mapped into the workspace.
            return Ok(Vec::new());
        }
        let output = output.check(&args)?;
        let records = parse_tagged(&String::from_utf8_lossy(&output.stdout));
        events_from_fstat(change, &records)
    }
}

fn change_numbers(
    records: &[TaggedRecord],
) -> Result<Vec<u64>, AdapterError> {
    records
        .iter()
        .filter_map(|record| record.get("change"))
        .map(|value| {
            value.parse::<u64>().map_err(|_| {
                AdapterError::Protocol(format!("change number {value:?}"))
            })
        })
        .collect()
}

#[async_trait]
impl RepositoryClient for P4CommandClient {
    async fn connect(&self) -> Result<(), AdapterError> {
        let records = self
            .run_tagged(&["info"])
            .await
            .map_err(|err| AdapterError::Connection(err.to_string()))?;
        check_info(&records, &self.client)
    }

    async fn changes_since(&self) -> Result<Vec<ChangeEvent>, AdapterError> {
        let cached = {
            let cursor = self.cursor.lock();
            cursor.next.map(|next| (next, cursor.last))
        };
        let (next, last) = match cached {
            Some(range) => range,
            None => (self.starting_change().await?, self.last_change().await?),
        };

        if let Some(last) = last
            && next > last
        {
            let mut cursor = self.cursor.lock();
            cursor.next = Some(next);
            cursor.last = Some(last);
            cursor.exhausted = true;
            return Ok(Vec::new());
        }

        let changes = self.submitted_changes(next, last).await?;
        let mut events = Vec::new();
        for change in &changes {
            events.extend(self.files_in_change(*change).await?);
        }

        let advanced = changes.last().map_or(next, |change| change + 1);
        {
            let mut cursor = self.cursor.lock();
            cursor.next = Some(advanced);
            cursor.last = last;
            cursor.exhausted = last.is_some_and(|last| advanced > last);
        }
        if advanced != next
            && let Err(err) = self.write_counter(advanced).await
        {
            warn!(
                "Failed to update counter {}: {err}",
                self.counter_name()
            );
        }

        Ok(events)
    }

    async fn fetch_content(
        &self,
        path: &str,
        revision: u32,
    ) -> Result<Vec<u8>, AdapterError> {
        let spec = format!("{path}#{revision}");
        let args = ["print", "-q", spec.as_str()];
        let output = self.run(&args).await?;
        if output.no_such_file() {
            return Err(AdapterError::StaleRevision {
                path: path.to_string(),
                revision,
            });
        }
        Ok(output.check(&args)?.stdout)
    }

    async fn write_attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
        value: &str,
    ) -> Result<(), AdapterError> {
        self.run_attribute(
            path,
            revision,
            &["attribute", "-f", "-n", name, "-v", value],
        )
        .await
    }

    async fn read_attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
    ) -> Result<Option<String>, AdapterError> {
        let output = self.fstat_at(path, revision, &["-Oa"]).await?;
        let records = parse_tagged(&String::from_utf8_lossy(&output.stdout));
        let key = format!("attr-{name}");
        Ok(records
            .iter()
            .find_map(|record| record.get(&key))
            .filter(|value| !value.is_empty())
            .cloned())
    }

    async fn clear_attribute(
        &self,
        path: &str,
        revision: u32,
        name: &str,
    ) -> Result<(), AdapterError> {
        // Without `-v` the attribute is removed.
        self.run_attribute(path, revision, &["attribute", "-f", "-n", name])
            .await
    }

    async fn disconnect(&self) {
        // Every command is its own session; nothing to release.
        debug!("released p4 client {}", self.client);
    }

    fn is_exhausted(&self) -> bool {
        self.cursor.lock().exhausted
    }
}

/// Split `-ztag` output into records. Records are separated by blank lines;
/// nested (`... ...`) and continuation lines are ignored.
pub(crate) fn parse_tagged(output: &str) -> Vec<TaggedRecord> {
    let mut records = Vec::new();
    let mut current = TaggedRecord::new();

    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        let Some(tag) = line.strip_prefix("... ") else {
            continue;
        };
        if tag.starts_with("...") {
            continue;
        }
        let (key, value) = tag.split_once(' ').unwrap_or((tag, ""));
        if current.contains_key(key) {
            // A repeated key without a separator starts a new record.
            records.push(std::mem::take(&mut current));
        }
        current.insert(key.to_string(), value.to_string());
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

fn check_info(
    records: &[TaggedRecord],
    client: &str,
) -> Result<(), AdapterError> {
    let info = records.first().ok_or_else(|| {
        AdapterError::Protocol("p4 info returned no data".to_string())
    })?;
    match info.get("clientName").map(String::as_str) {
        Some(UNKNOWN_CLIENT) | None => Err(AdapterError::Connection(format!(
            "client {client} is unknown to the server"
        ))),
        Some(_) => Ok(()),
    }
}

fn events_from_fstat(
    change: u64,
    records: &[TaggedRecord],
) -> Result<Vec<ChangeEvent>, AdapterError> {
    let mut events = Vec::new();
    for record in records {
        let Some(path) = record.get("depotFile") else {
            continue;
        };
        let action = record.get("headAction").map_or("", String::as_str);
        if ["delete", "purge", "archive"]
            .iter()
            .any(|gone| action.contains(gone))
        {
            continue;
        }
        let revision = parse_field::<u32>(record, "headRev", path)?;
        let size = parse_field::<u64>(record, "fileSize", path)?;
        events.push(ChangeEvent {
            change,
            path: path.clone(),
            revision,
            size,
            file_type: record.get("headType").cloned().unwrap_or_default(),
        });
    }
    Ok(events)
}

fn parse_field<T: std::str::FromStr>(
    record: &TaggedRecord,
    key: &str,
    path: &str,
) -> Result<T, AdapterError> {
    let value = record.get(key).ok_or_else(|| {
        AdapterError::Protocol(format!("fstat for {path} lacks {key}"))
    })?;
    value.parse().map_err(|_| {
        AdapterError::Protocol(format!("fstat for {path} has {key} {value:?}"))
    })
}
