use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::{IntoReport, ResultExt};
use sluice_core::{ColumnType, ProducerMetadata};
use sluice_execinfra::{RowBuffer, RowReceiver, ServerConfig, Settings};
use sluice_flow::{FlowServer, FlowSetupOptions, FuseOpt, LocalCluster, VectorizeMode};
use sluice_physical::{FlowSpec, ProcessorCoreSpec, StreamType};
use tracing::{info, info_span, Instrument};

/// Options for the Run command.
#[derive(clap::Args, Debug)]
#[command(version, rename_all = "kebab-case")]
pub struct RunCommand {
    /// YAML file containing the cluster settings. Unset settings keep their
    /// defaults.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Overrides a setting, as `name=value`.
    ///
    /// For example `--set sql.distsql.flow_stream_timeout=2s`.
    #[arg(long = "set", value_name = "NAME=VALUE")]
    pub overrides: Vec<String>,

    /// Whether to move column batches between processors.
    #[arg(long, value_enum, default_value_t = Vectorize::Off)]
    pub vectorize: Vectorize,

    /// Also fuse producers into unordered inputs with several streams.
    #[arg(long)]
    pub aggressive_fusion: bool,

    /// Record processor and router output stats.
    #[arg(long)]
    pub collect_stats: bool,

    /// Parent directory of the temporary storage for rows spilled to disk.
    /// Defaults to the system temp directory.
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Input file containing the flow to run.
    pub flow: PathBuf,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vectorize {
    Off,
    On,
    Auto,
}

impl From<Vectorize> for VectorizeMode {
    fn from(value: Vectorize) -> Self {
        match value {
            Vectorize::Off => VectorizeMode::Off,
            Vectorize::On => VectorizeMode::On,
            Vectorize::Auto => VectorizeMode::Auto,
        }
    }
}

#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "failed to read '{}'", "_0.display()")]
    Read(PathBuf),
    #[display(fmt = "invalid flow spec")]
    InvalidFlow,
    #[display(fmt = "invalid settings")]
    InvalidSettings,
    #[display(fmt = "expected NAME=VALUE, got '{_0}'")]
    InvalidOverride(String),
    #[display(fmt = "failed to configure the node")]
    Config,
    #[display(fmt = "failed to run flow")]
    Execution,
    #[display(fmt = "flow failed: {_0}")]
    FlowFailed(String),
    #[display(fmt = "failed to write output")]
    Output,
}

impl error_stack::Context for Error {}

impl RunCommand {
    /// Runs the flow and writes its rows to stdout.
    pub async fn execute(self) -> error_stack::Result<(), Error> {
        let stdout = std::io::stdout();
        self.execute_to(&mut stdout.lock()).await
    }

    /// Runs the flow on an in-process node named after the flow's gateway,
    /// writing one line per row and then one line per metadata record.
    pub async fn execute_to(&self, out: &mut dyn Write) -> error_stack::Result<(), Error> {
        let span = info_span!("sluice run", flow = %self.flow.display());
        self.run(out).instrument(span).await
    }

    async fn run(&self, out: &mut dyn Write) -> error_stack::Result<(), Error> {
        info!("Options: {:?}", self);

        let yaml = std::fs::read_to_string(&self.flow)
            .into_report()
            .change_context_lazy(|| Error::Read(self.flow.clone()))?;
        let spec = FlowSpec::from_yaml(&yaml).change_context(Error::InvalidFlow)?;
        let settings = self.load_settings()?;

        let cluster = LocalCluster::new();
        let cfg = ServerConfig::new(spec.gateway, settings, self.temp_dir.as_deref())
            .change_context(Error::Config)?
            .with_dialer(cluster.clone());
        let server = FlowServer::new(cfg);
        cluster.add_node(&server);

        let options = FlowSetupOptions {
            fuse: if self.aggressive_fusion {
                FuseOpt::Aggressive
            } else {
                FuseOpt::Normal
            },
            vectorize: self.vectorize.into(),
            collect_stats: self.collect_stats,
        };
        let types = output_types(&spec);
        let buffer = RowBuffer::new(types);
        let consumer: Arc<dyn RowReceiver> = buffer.clone();
        server
            .run_sync_flow(&spec, consumer, &options)
            .await
            .change_context(Error::Execution)?;

        let (rows, metas) = buffer.take_all();
        info!(rows = rows.len(), metadata = metas.len(), "Flow finished");
        for row in &rows {
            writeln!(out, "{row}")
                .into_report()
                .change_context(Error::Output)?;
        }
        for meta in &metas {
            writeln!(out, "-- {}", describe(meta))
                .into_report()
                .change_context(Error::Output)?;
        }
        if let Some(err) = metas.iter().find_map(ProducerMetadata::error) {
            error_stack::bail!(Error::FlowFailed(err.to_string()));
        }
        Ok(())
    }

    fn load_settings(&self) -> error_stack::Result<Settings, Error> {
        let mut settings = match &self.settings {
            Some(path) => {
                let yaml = std::fs::read_to_string(path)
                    .into_report()
                    .change_context_lazy(|| Error::Read(path.clone()))?;
                serde_yaml::from_str(&yaml)
                    .into_report()
                    .change_context(Error::InvalidSettings)?
            }
            None => Settings::default(),
        };
        for item in &self.overrides {
            let (name, value) = item
                .split_once('=')
                .ok_or_else(|| Error::InvalidOverride(item.clone()))?;
            settings
                .set(name.trim(), value.trim())
                .change_context(Error::InvalidSettings)?;
        }
        Ok(settings)
    }
}

/// Column types of the rows the flow sends to the gateway.
fn output_types(spec: &FlowSpec) -> Vec<ColumnType> {
    let Some(processor) = spec.processors.iter().find(|p| {
        p.outputs
            .iter()
            .flat_map(|o| o.streams.iter())
            .any(|s| s.stream_type == StreamType::SyncResponse)
    }) else {
        return Vec::new();
    };
    let types = match (&processor.core, processor.inputs.first()) {
        (ProcessorCoreSpec::Values { column_types, .. }, _) => column_types.clone(),
        (_, Some(input)) => input.column_types.clone(),
        (_, None) => Vec::new(),
    };
    match &processor.post.output_columns {
        Some(columns) => columns.iter().filter_map(|c| types.get(*c).cloned()).collect(),
        None => types,
    }
}

fn describe(meta: &ProducerMetadata) -> String {
    match meta.error() {
        Some(err) => format!("error: {err}"),
        None => format!("{meta:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sluice_core::{Datum, Row};

    use super::*;

    fn command(flow: PathBuf) -> RunCommand {
        sluice_testing::init_test_logging();
        RunCommand {
            settings: None,
            overrides: Vec::new(),
            vectorize: Vectorize::Off,
            aggressive_fusion: false,
            collect_stats: false,
            temp_dir: None,
            flow,
        }
    }

    fn testdata(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("testdata")
            .join(name)
    }

    async fn run_lines(command: &RunCommand) -> Vec<String> {
        let mut out = Vec::new();
        command.execute_to(&mut out).await.unwrap();
        let mut lines: Vec<_> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect();
        lines.sort();
        lines
    }

    #[tokio::test]
    async fn test_runs_flow_file() {
        let expected: Vec<String> = [
            Row::new(vec![Datum::Int(1), Datum::from("a")]),
            Row::new(vec![Datum::Int(2), Datum::from("b")]),
            Row::new(vec![Datum::Int(3), Datum::Null]),
        ]
        .iter()
        .map(|row| row.to_string())
        .collect();

        let mut run = command(testdata("values.yaml"));
        assert_eq!(run_lines(&run).await, expected);

        run.vectorize = Vectorize::On;
        run.aggressive_fusion = true;
        assert_eq!(run_lines(&run).await, expected);
    }

    #[tokio::test]
    async fn test_unconnected_stream_fails() {
        let dir = tempfile::tempdir().unwrap();
        let flow = dir.path().join("remote.yaml");
        std::fs::write(
            &flow,
            r#"
flow_id: 67e55044-10b1-426f-9247-bb680e5fe0c8
gateway: 1
processors:
  - processor_id: 0
    inputs:
      - column_types: [int]
        streams:
          - { stream_id: 1, type: REMOTE }
    core:
      kind: noop
    outputs:
      - type: PASS_THROUGH
        streams:
          - { stream_id: 0, type: SYNC_RESPONSE }
"#,
        )
        .unwrap();

        let mut run = command(flow);
        run.overrides = vec!["sql.distsql.flow_stream_timeout = 50ms".to_owned()];
        let mut out = Vec::new();
        let err = run.execute_to(&mut out).await.unwrap_err();
        assert!(matches!(err.current_context(), Error::FlowFailed(_)));
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("-- error: "), "{out}");
    }

    #[test]
    fn test_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "flow_stream_timeout: 3s\n").unwrap();

        let mut run = command(testdata("values.yaml"));
        run.settings = Some(path);
        assert_eq!(
            run.load_settings().unwrap().flow_stream_timeout,
            Duration::from_secs(3)
        );

        run.overrides = vec!["sql.distsql.flow_stream_timeout=2s".to_owned()];
        assert_eq!(
            run.load_settings().unwrap().flow_stream_timeout,
            Duration::from_secs(2)
        );

        run.overrides = vec!["flow_stream_timeout".to_owned()];
        let err = run.load_settings().unwrap_err();
        insta::assert_snapshot!(err.current_context(), @"expected NAME=VALUE, got 'flow_stream_timeout'");
    }
}
