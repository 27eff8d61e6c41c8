use crate::utils::format_bytes;
use clap::ValueEnum;
use colored::*;
use rbdsr_core::{DiskState, ErrorKind, RepositoryRecord, SrError, VirtualDiskRecord};
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

pub trait OutputFormatter {
    fn format<T: Serialize>(&self, data: T) -> String;
    fn format_table<T: Tabled + Serialize>(&self, rows: Vec<T>) -> String;
}

impl OutputFormatter for OutputFormat {
    fn format<T: Serialize>(&self, data: T) -> String {
        match self {
            OutputFormat::Table | OutputFormat::Json => {
                serde_json::to_string_pretty(&data).unwrap_or_else(|e| e.to_string())
            }
            OutputFormat::Yaml => serde_yaml::to_string(&data).unwrap_or_else(|e| e.to_string()),
        }
    }

    fn format_table<T: Tabled + Serialize>(&self, rows: Vec<T>) -> String {
        match self {
            OutputFormat::Table => {
                if rows.is_empty() {
                    "No data to display".to_string()
                } else {
                    Table::new(rows).to_string()
                }
            }
            OutputFormat::Json => {
                serde_json::to_string_pretty(&rows).unwrap_or_else(|e| e.to_string())
            }
            OutputFormat::Yaml => serde_yaml::to_string(&rows).unwrap_or_else(|e| e.to_string()),
        }
    }
}

#[derive(Serialize, Tabled)]
pub struct RepositoryRow {
    uuid: String,
    pool: String,
    capacity: String,
    used: String,
    free: String,
    quota: String,
    allocated: String,
    volume_group: String,
}

impl From<&RepositoryRecord> for RepositoryRow {
    fn from(record: &RepositoryRecord) -> Self {
        let stats = record.stats;
        RepositoryRow {
            uuid: record.id.to_string(),
            pool: record.pool.pool.clone(),
            capacity: format_bytes(stats.capacity),
            used: format_bytes(stats.used),
            free: format_bytes(stats.free),
            quota: stats.quota.map(format_bytes).unwrap_or_else(|| "-".to_string()),
            allocated: format_bytes(record.virtual_allocation),
            volume_group: record
                .overlay
                .as_ref()
                .map(|o| o.volume_group.clone())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Serialize, Tabled)]
pub struct DiskRow {
    uuid: String,
    backing: String,
    size: String,
    state: String,
    read_only: bool,
    sharable: bool,
    device: String,
    parent: String,
}

impl From<&VirtualDiskRecord> for DiskRow {
    fn from(disk: &VirtualDiskRecord) -> Self {
        let state = match disk.state {
            DiskState::Attached => "Attached".green().to_string(),
            DiskState::Unattached => "Unattached".normal().to_string(),
            DiskState::Attaching => "Attaching".cyan().to_string(),
            DiskState::Detaching => "Detaching".yellow().to_string(),
        };

        DiskRow {
            uuid: disk.id.to_string(),
            backing: disk.backing.to_string(),
            size: format_bytes(disk.size_bytes),
            state,
            read_only: disk.read_only,
            sharable: disk.sharable,
            device: disk
                .device_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            parent: disk
                .parent
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Repository output: rows in table mode, the full record otherwise.
pub fn print_repository(format: OutputFormat, record: &RepositoryRecord) {
    match format {
        OutputFormat::Table => {
            println!("{}", format.format_table(vec![RepositoryRow::from(record)]))
        }
        _ => println!("{}", format.format(record)),
    }
}

pub fn print_disks(format: OutputFormat, disks: &[VirtualDiskRecord]) {
    match format {
        OutputFormat::Table => {
            let rows = disks.iter().map(DiskRow::from).collect();
            println!("{}", format.format_table::<DiskRow>(rows));
        }
        _ => println!("{}", format.format(disks)),
    }
}

pub fn print_disk(format: OutputFormat, disk: &VirtualDiskRecord) {
    print_disks(format, std::slice::from_ref(disk));
}

#[derive(Serialize)]
struct FailureReport<'a> {
    kind: ErrorKind,
    message: &'a str,
}

/// Error reply for the control plane: `{kind, message}` in machine formats.
pub fn print_failure(format: OutputFormat, error: &SrError) {
    let message = error.to_string();
    match format {
        OutputFormat::Table => print_error(&format!("{}: {}", error.kind(), message)),
        _ => {
            let report = FailureReport {
                kind: error.kind(),
                message: &message,
            };
            eprintln!("{}", format.format(report));
        }
    }
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow(), message);
}

#[derive(Serialize)]
struct Done<'a> {
    status: &'static str,
    message: &'a str,
}

/// Acknowledge an operation that has no record to show.
pub fn print_done(format: OutputFormat, message: &str) {
    match format {
        OutputFormat::Table => print_success(message),
        _ => println!(
            "{}",
            format.format(Done {
                status: "ok",
                message
            })
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbdsr_core::{CapacityStats, DeviceConfig, DriverKind};
    use uuid::Uuid;

    #[test]
    fn test_repository_row_reports_virtual_allocation() {
        let device = DeviceConfig::parse_pairs(DriverKind::Rbd, ["pool=vms"]).expect("valid");
        let mut record = RepositoryRecord::new(Uuid::new_v4(), device.pool, None);
        record.update_stats(CapacityStats::new(10 << 30, 1 << 30, None));
        record.virtual_allocation = 25 << 30;

        let row = RepositoryRow::from(&record);
        assert_eq!(row.allocated, "25.0G");
        assert_eq!(row.used, "1.0G");
        assert_eq!(row.volume_group, "-");

        let json = OutputFormat::Json.format(&record);
        assert!(json.contains("\"virtual_allocation\": 26843545600"), "{json}");
    }
}
