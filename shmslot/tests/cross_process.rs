//! Cross-process tests: the test binary re-executes itself as worker processes

use shmslot::{Role, SharedStore, ShmResult, StoreOptions};
use std::process::{Command, Stdio};
use std::time::Duration;

const SEGMENT_ENV: &str = "SHMSLOT_WORKER_SEGMENT";
const ROUNDS_ENV: &str = "SHMSLOT_WORKER_ROUNDS";
const WORKERS: usize = 4;
const ROUNDS: u64 = 5_000;

fn options() -> StoreOptions {
    StoreOptions::default()
        .with_require_root(false)
        .with_ready_timeout(Duration::from_millis(500))
}

/// Worker body. A no-op unless launched by [`test_processes_share_one_segment`].
#[test]
fn worker_increment() -> ShmResult<()> {
    let Ok(name) = std::env::var(SEGMENT_ENV) else {
        return Ok(());
    };
    let rounds: u64 = std::env::var(ROUNDS_ENV)
        .ok()
        .and_then(|r| r.parse().ok())
        .unwrap_or(ROUNDS);

    let (store, role) = SharedStore::<u64>::open_with(&name, 16, &options())?;
    let view = store.view();
    let mut forced = 0u64;
    for _ in 0..rounds {
        view.access_checked(0, |count, outcome| {
            *count += 1;
            if outcome.is_forced() {
                forced += 1;
            }
        })?;
    }
    // libtest prints "test worker_increment ... " without a newline first
    println!("\nROLE={role} FORCED={forced} CAPACITY={}", store.capacity());
    Ok(())
}

struct WorkerReport {
    role: String,
    forced: u64,
    capacity: usize,
}

fn parse_report(stdout: &str) -> Option<WorkerReport> {
    let line = stdout
        .lines()
        .find_map(|l| l.find("ROLE=").map(|start| &l[start..]))?;
    let mut report = WorkerReport {
        role: String::new(),
        forced: 0,
        capacity: 0,
    };
    for field in line.split_whitespace() {
        let Some(pair) = field.split_once('=') else {
            continue;
        };
        match pair {
            ("ROLE", v) => report.role = v.to_string(),
            ("FORCED", v) => report.forced = v.parse().ok()?,
            ("CAPACITY", v) => report.capacity = v.parse().ok()?,
            _ => {}
        }
    }
    Some(report)
}

/// Removes the segment however the test ends.
struct SegmentCleanup(String);

impl Drop for SegmentCleanup {
    fn drop(&mut self) {
        let _ = SharedStore::<u64>::unlink(&self.0);
    }
}

#[test]
fn test_report_parsing() {
    let inline = "running 1 test\ntest worker_increment ... ROLE=joined FORCED=3 CAPACITY=16 ok\n";
    let report = parse_report(inline).expect("inline report");
    assert_eq!(report.role, "joined");
    assert_eq!(report.forced, 3);
    assert_eq!(report.capacity, 16);

    let own_line = "test worker_increment ... \nROLE=created FORCED=0 CAPACITY=8\nok\n";
    let report = parse_report(own_line).expect("report on its own line");
    assert_eq!(report.role, "created");
    assert_eq!(report.capacity, 8);

    assert!(parse_report("test worker_increment ... ok\n").is_none());
}

#[test]
fn test_processes_share_one_segment() -> ShmResult<()> {
    let name = format!("shmslot_xproc_{}", std::process::id());
    let _ = SharedStore::<u64>::unlink(&name);
    let _cleanup = SegmentCleanup(name.clone());
    let exe = std::env::current_exe()?;

    let children: Vec<_> = (0..WORKERS)
        .map(|_| {
            Command::new(&exe)
                .args(["--exact", "worker_increment", "--nocapture", "--test-threads=1"])
                .env(SEGMENT_ENV, &name)
                .env(ROUNDS_ENV, ROUNDS.to_string())
                .stdout(Stdio::piped())
                .spawn()
        })
        .collect::<Result<_, _>>()?;

    let mut reports = Vec::new();
    for child in children {
        let output = child.wait_with_output()?;
        assert!(output.status.success(), "worker failed: {:?}", output);
        let stdout = String::from_utf8_lossy(&output.stdout);
        reports.push(parse_report(&stdout).expect("worker printed a report"));
    }

    let created = reports.iter().filter(|r| r.role == "created").count();
    let joined = reports.iter().filter(|r| r.role == "joined").count();
    assert_eq!(created, 1);
    assert_eq!(joined, WORKERS - 1);
    assert!(reports.iter().all(|r| r.capacity == 16));

    let (store, role) = SharedStore::<u64>::open_with(&name, 16, &options())?;
    assert_eq!(role, Role::Joined);
    let total = store.view().access(0, |v| *v)?;
    let forced: u64 = reports.iter().map(|r| r.forced).sum();
    assert!(total <= WORKERS as u64 * ROUNDS);
    if forced == 0 {
        assert_eq!(total, WORKERS as u64 * ROUNDS);
    }

    drop(store);
    assert!(SharedStore::<u64>::unlink(&name)?);
    Ok(())
}
