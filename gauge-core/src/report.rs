//! CSV result log
//!
//! One header row followed by one data row per combination. The header
//! text, the `True`/`False`/`None` field spellings and the two-decimal
//! formatting are frozen: downstream tooling diffs these logs against
//! historical ones.

use anyhow::{Context, Result};
use csv::Writer;
use std::fmt::Display;
use std::fs::File;
use std::io::Write as _;
use std::path::Path;

use crate::harness::{CombinationResult, RunConfig};
use crate::quant::QuantizationDescriptors;

pub const CSV_HEADER: &str = "gptq, act_order, bits, group_size, kernel, num_batches, batch_size, \
prompt_length, new_tokens, Load time (s), Per-token latency (ms), Throughput (tok/s), Max memory (MB)";

/// Log file name for a benchmarked model.
pub fn log_file_name(model_id: &str, quantized: bool) -> String {
    let suffix = if quantized { "gptq" } else { "nogptq" };
    format!("log_{}_{}.csv", model_id.replace('/', "-"), suffix)
}

fn log_bool(value: bool) -> String {
    if value { "True" } else { "False" }.to_string()
}

fn log_opt<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

/// One finalized record per combination. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub quant: QuantizationDescriptors,
    pub num_batches: usize,
    pub batch_size: usize,
    pub prompt_length: usize,
    pub new_tokens: usize,
    pub load_time_secs: f64,
    pub per_token_latency_ms: f64,
    pub throughput_tok_s: f64,
    pub max_memory_mb: f64,
}

impl ResultRow {
    pub fn new(
        quant: QuantizationDescriptors,
        config: &RunConfig,
        load_time_secs: f64,
        result: &CombinationResult,
    ) -> Self {
        Self {
            quant,
            num_batches: config.num_batches,
            batch_size: config.batch_size,
            prompt_length: config.prompt_length,
            new_tokens: config.new_tokens,
            load_time_secs,
            per_token_latency_ms: result.metrics.per_token_latency_ms,
            throughput_tok_s: result.metrics.throughput_tok_s,
            max_memory_mb: result.peak_memory_mb,
        }
    }

    fn record(&self) -> Vec<String> {
        vec![
            log_bool(self.quant.used),
            self.quant.act_order.map_or_else(|| "None".to_string(), log_bool),
            log_opt(self.quant.bits),
            log_opt(self.quant.group_size),
            log_opt(self.quant.kernel.map(|k| k.csv_name())),
            self.num_batches.to_string(),
            self.batch_size.to_string(),
            self.prompt_length.to_string(),
            self.new_tokens.to_string(),
            format!("{:.2}", self.load_time_secs),
            format!("{:.2}", self.per_token_latency_ms),
            format!("{:.2}", self.throughput_tok_s),
            format!("{:.2}", self.max_memory_mb),
        ]
    }
}

/// Append-only CSV log, flushed after every row so completed combinations
/// survive a later abort.
pub struct CsvReport {
    writer: Writer<File>,
}

impl CsvReport {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        writeln!(file, "{CSV_HEADER}")?;
        Ok(Self {
            writer: Writer::from_writer(file),
        })
    }

    pub fn append(&mut self, row: &ResultRow) -> Result<()> {
        self.writer.write_record(row.record())?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::RunMetrics;
    use crate::quant::{Kernel, QuantizationConfig};

    fn dense_row() -> ResultRow {
        let config = RunConfig {
            batch_size: 2,
            prompt_length: 128,
            new_tokens: 32,
            num_batches: 3,
        };
        let result = CombinationResult {
            mean_latency_ms: 128.0,
            metrics: RunMetrics {
                per_token_latency_ms: 4.0,
                throughput_tok_s: 500.0,
            },
            peak_memory_mb: 1234.559,
        };
        ResultRow::new(QuantizationDescriptors::none(), &config, 12.341, &result)
    }

    #[test]
    fn file_name_replaces_slashes_and_marks_quantization() {
        assert_eq!(log_file_name("gpt2", false), "log_gpt2_nogptq.csv");
        assert_eq!(
            log_file_name("TheBloke/Llama-2-7B-GPTQ", true),
            "log_TheBloke-Llama-2-7B-GPTQ_gptq.csv"
        );
    }

    #[test]
    fn dense_row_uses_none_for_quant_columns() {
        assert_eq!(
            dense_row().record(),
            vec![
                "False", "None", "None", "None", "None", "3", "2", "128", "32", "12.34", "4.00",
                "500.00", "1234.56",
            ]
        );
    }

    #[test]
    fn quantized_row_spells_out_the_descriptors() {
        let quant_config = QuantizationConfig {
            desc_act: false,
            bits: 4,
            group_size: 128,
        };
        let mut row = dense_row();
        row.quant = QuantizationDescriptors::from_config(&quant_config, Kernel::Exllama);
        let record = row.record();
        assert_eq!(
            &record[..5],
            &["True", "False", "4", "128", "exllama"]
        );
    }

    #[test]
    fn report_writes_header_and_flushed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log_test.csv");
        let mut report = CsvReport::create(&path).unwrap();
        report.append(&dense_row()).unwrap();
        report.append(&dense_row()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("False,None,None,None,None,3,2,128,32,"));
    }
}
