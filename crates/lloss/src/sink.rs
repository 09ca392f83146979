//! Observability sinks for loss curves and per-cycle selection diagnostics.
//!
//! Sinks are best effort: training and acquisition call them through
//! [`record_best_effort`] / [`record_selection_best_effort`], which log
//! failures and carry on.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::ActiveLearningError;

/// One scored subpool example as seen by the selection step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SelectionRow {
    pub index: usize,
    pub score: f64,
    pub true_loss: f64,
    pub picked: bool,
}

/// Receiver for diagnostic scalars.
pub trait ObservabilitySink {
    /// Record named scalars at a training iteration.
    fn record(&mut self, iteration: u64, scalars: &[(&str, f64)]) -> anyhow::Result<()>;

    /// Record the scored subpool of one acquisition. Ignored by default.
    fn record_selection(&mut self, _trial: usize, _cycle: usize, _rows: &[SelectionRow]) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<S: ObservabilitySink + ?Sized> ObservabilitySink for &mut S {
    fn record(&mut self, iteration: u64, scalars: &[(&str, f64)]) -> anyhow::Result<()> {
        (**self).record(iteration, scalars)
    }

    fn record_selection(&mut self, trial: usize, cycle: usize, rows: &[SelectionRow]) -> anyhow::Result<()> {
        (**self).record_selection(trial, cycle, rows)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ObservabilitySink for NullSink {
    fn record(&mut self, _iteration: u64, _scalars: &[(&str, f64)]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Emits records as `tracing` debug events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record(&mut self, iteration: u64, scalars: &[(&str, f64)]) -> anyhow::Result<()> {
        let line = scalars
            .iter()
            .map(|(name, value)| format!("{name}={value:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!(iteration, "{line}");
        Ok(())
    }
}

/// Appends one JSON object per record to a file.
///
/// Loss records look like `{"iteration": 10, "backbone": 2.1, ...}`;
/// selection rows add `"trial"` and `"cycle"`.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl ObservabilitySink for JsonlSink {
    fn record(&mut self, iteration: u64, scalars: &[(&str, f64)]) -> anyhow::Result<()> {
        let mut object = serde_json::Map::new();
        object.insert("iteration".into(), iteration.into());
        for (name, value) in scalars {
            object.insert((*name).to_string(), (*value).into());
        }
        serde_json::to_writer(&mut self.writer, &object)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn record_selection(&mut self, trial: usize, cycle: usize, rows: &[SelectionRow]) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct Line<'a> {
            trial: usize,
            cycle: usize,
            #[serde(flatten)]
            row: &'a SelectionRow,
        }
        for row in rows {
            serde_json::to_writer(&mut self.writer, &Line { trial, cycle, row })?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Forward to `sink.record`, logging instead of propagating failures.
pub fn record_best_effort(sink: &mut dyn ObservabilitySink, iteration: u64, scalars: &[(&str, f64)]) {
    if let Err(e) = sink.record(iteration, scalars) {
        let err = ActiveLearningError::Observability(e);
        tracing::warn!(iteration, "{err}");
    }
}

/// Forward to `sink.record_selection`, logging instead of propagating failures.
pub fn record_selection_best_effort(sink: &mut dyn ObservabilitySink, trial: usize, cycle: usize, rows: &[SelectionRow]) {
    if let Err(e) = sink.record_selection(trial, cycle, rows) {
        let err = ActiveLearningError::Observability(e);
        tracing::warn!(trial, cycle, "{err}");
    }
}
