//! Log output of the distributor, captured through a process-wide logger.
use std::borrow::Cow;
use std::sync::Arc;

use log::{Level, LevelFilter, Log, Metadata, Record};
use mesh_all_to_all::algs::all_to_all::{
    Algorithm, DistFlags, Distributor, DistributorConfig, ExchangeMetrics,
};
use mesh_all_to_all::algs::communicator::NoComm;
use parking_lot::{Mutex, const_mutex};
use serial_test::serial;

struct Capture {
    lines: Mutex<Vec<(Level, String)>>,
}

impl Log for Capture {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }
    fn log(&self, record: &Record) {
        self.lines
            .lock()
            .push((record.level(), record.args().to_string()));
    }
    fn flush(&self) {}
}

static CAPTURE: Capture = Capture {
    lines: const_mutex(Vec::new()),
};

fn captured<R>(f: impl FnOnce() -> R) -> (R, Vec<(Level, String)>) {
    let _ = log::set_logger(&CAPTURE);
    log::set_max_level(LevelFilter::Trace);
    CAPTURE.lines.lock().clear();
    let r = f();
    let lines = std::mem::take(&mut *CAPTURE.lines.lock());
    (r, lines)
}

#[test]
#[serial]
fn summary_is_logged_at_info() {
    let metrics = Arc::new(ExchangeMetrics::default());
    let ((), lines) = captured(|| {
        let cfg =
            DistributorConfig::new(Algorithm::CrystalRouter).with_metrics(Arc::clone(&metrics));
        let mut d =
            Distributor::new(2, DistFlags::NONE, None, Cow::Owned(vec![0, 0]), &NoComm, cfg)
                .unwrap();
        let _: Vec<u32> = d.copy_array(1, false, &[4, 5]).unwrap();
        d.destroy();
        metrics.log_summary(Algorithm::CrystalRouter);
    });
    let info: Vec<&String> = lines
        .iter()
        .filter(|(l, _)| *l == Level::Info)
        .map(|(_, s)| s)
        .collect();
    assert_eq!(info.len(), 1);
    assert!(info[0].contains("crystal router algorithm"));
    assert!(info[0].contains("Total:"));
    assert!(info[0].contains("Data exchange:"));
}

#[test]
#[serial]
fn ignored_dest_ids_warn() {
    let (d, lines) = captured(|| {
        Distributor::new(
            1,
            DistFlags::NONE,
            Some(Cow::Owned(vec![0])),
            Cow::Owned(vec![0]),
            &NoComm,
            DistributorConfig::default(),
        )
    });
    assert!(d.is_ok());
    assert!(lines.iter().any(|(l, s)| *l == Level::Warn && s.contains("ignored")));
}

#[test]
#[serial]
fn nothing_logged_without_calls() {
    let ((), lines) = captured(|| ExchangeMetrics::default().log_summary(Algorithm::Direct));
    assert!(lines.is_empty());
}
