use super::installer::custom_runfile_name;
use super::*;
use crate::download::HttpDownloader;
use crate::gpuconfig::{BuildRequest, VersionType};
use crate::object_store::{memory, ByteStream};
use bytes::Bytes;
use pretty_assertions::assert_eq;
use std::sync::Mutex;

const KERNEL_VERSION: &str = "5.15.55-34.m101";
const OUTPUT_DIR: &str = "gs://nvidia-drivers-us-public/nvidia-cos-project/5.15.55-34.m101/";

impl BatchReport {
    fn outcomes(&self) -> Vec<&Outcome> {
        self.records.iter().map(|r| &r.outcome).collect()
    }
}

/// Stands in for the NVIDIA installer. Records the work directories it was handed and writes a
/// package named like the real installer would.
#[derive(Debug, Default)]
struct FakeCompiler {
    work_dirs: Mutex<Vec<PathBuf>>,
    fail: bool,
    panic_on: Option<String>,
    cancel_batch: bool,
}

#[async_trait]
impl DriverCompiler for FakeCompiler {
    async fn compile(
        &self,
        work_dir: &Path,
        artifacts: &Artifacts,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, BuildError> {
        self.work_dirs.lock().unwrap().push(work_dir.to_path_buf());

        for path in [
            &artifacts.toolchain,
            &artifacts.kernel_headers,
            &artifacts.toolchain_env,
        ] {
            assert!(path.starts_with(work_dir), "{path:?} outside work dir");
            assert!(path.is_file(), "{path:?} was not fetched");
        }
        assert!(work_dir.join(&artifacts.runfile).is_file());

        if self.panic_on.as_deref() == Some(artifacts.runfile.as_str()) {
            panic!("installer crashed");
        }

        if self.cancel_batch {
            cancel.cancel();
            return Err(BuildError::Cancelled);
        }

        if self.fail {
            return Err(BuildError::Compile("installer exited with status 1".into()));
        }

        let package = work_dir.join(custom_runfile_name(&artifacts.runfile));
        std::fs::write(&package, format!("custom {}", artifacts.runfile)).unwrap();
        Ok(package)
    }
}

fn runfile_uri(driver_version: &str) -> String {
    format!("gs://nvidia-drivers-mirror/tesla/{driver_version}/NVIDIA-Linux-x86_64-{driver_version}.run")
}

fn record(driver_version: &str) -> ConfigRecord {
    let build_dir = format!("gs://cos-kernel-artifacts/builds/{KERNEL_VERSION}");

    ConfigRecord::new(
        KERNEL_VERSION,
        VersionType::Kernel,
        driver_version,
        BuildRequest {
            kernel_src_tarball_gcs: format!("{build_dir}/cos-kernel-src-{KERNEL_VERSION}.tgz"),
            kernel_headers_tarball_gcs: format!(
                "{build_dir}/cos-kernel-headers-{KERNEL_VERSION}-x86_64.tgz"
            ),
            nvidia_runfile_address: runfile_uri(driver_version),
            toolchain_tarball_gcs:
                "gs://chromiumos-sdk/2021/06/x86_64-cros-linux-gnu-2021.06.26.094653.tar.xz".into(),
            toolchain_env_gcs: format!("{build_dir}/toolchain_env.x86_64"),
            driver_output_gcs_dir: OUTPUT_DIR.into(),
        },
    )
}

struct TestHarness {
    store: Arc<memory::Engine>,
    compiler: Arc<FakeCompiler>,
    builder: Builder,
    work_root: tempfile::TempDir,
}

impl TestHarness {
    async fn new(compiler: FakeCompiler, driver_versions: &[&str]) -> Self {
        let store = Arc::new(memory::Engine::new());

        let build_dir = format!("gs://cos-kernel-artifacts/builds/{KERNEL_VERSION}");
        let objects = [
            (
                format!("{build_dir}/cos-kernel-headers-{KERNEL_VERSION}-x86_64.tgz"),
                "headers",
            ),
            (format!("{build_dir}/toolchain_env.x86_64"), "CC=clang\n"),
            (
                "gs://chromiumos-sdk/2021/06/x86_64-cros-linux-gnu-2021.06.26.094653.tar.xz"
                    .to_string(),
                "toolchain",
            ),
        ];
        for (uri, content) in objects {
            store.put(&uri, Bytes::from(content)).await.unwrap();
        }
        for driver_version in driver_versions {
            store
                .put(&runfile_uri(driver_version), Bytes::from("runfile"))
                .await
                .unwrap();
        }

        Self::with_store(store.clone(), store, compiler)
    }

    fn with_store(
        store: Arc<memory::Engine>,
        builder_store: Arc<dyn ObjectStore>,
        compiler: FakeCompiler,
    ) -> Self {
        let work_root = tempfile::tempdir().unwrap();
        let compiler = Arc::new(compiler);

        let builder = Builder::new(
            builder_store.clone(),
            ArtifactResolver::new(builder_store, Arc::new(HttpDownloader::new(1))),
            compiler.clone(),
            Config {
                work_root: work_root.path().to_path_buf(),
                parallelism: 1,
            },
        );

        Self {
            store,
            compiler,
            builder,
            work_root,
        }
    }

    async fn published(&self, driver_version: &str) -> Option<Bytes> {
        let uri = record(driver_version).output_driver_uri();
        self.store.get(&uri).await.ok()
    }

    fn work_root_is_empty(&self) -> bool {
        std::fs::read_dir(self.work_root.path()).unwrap().next().is_none()
    }
}

#[tokio::test]
async fn builds_and_publishes() {
    let harness = TestHarness::new(FakeCompiler::default(), &["470.82.01"]).await;

    let report = harness
        .builder
        .process(vec![record("470.82.01")], false, CancellationToken::new())
        .await;

    assert_eq!(
        report.records,
        vec![RecordReport {
            version: KERNEL_VERSION.into(),
            driver_version: "470.82.01".into(),
            output_uri: format!("{OUTPUT_DIR}NVIDIA-Linux-x86_64-470.82.01-custom.run"),
            outcome: Outcome::Succeeded,
        }]
    );
    assert_eq!(
        harness.published("470.82.01").await.unwrap(),
        Bytes::from("custom NVIDIA-Linux-x86_64-470.82.01.run")
    );
}

#[tokio::test]
/// A record whose artifacts cannot be fetched fails alone; the rest of the batch still builds.
async fn failure_is_isolated_to_record() {
    // The second driver's run-file is never uploaded.
    let harness = TestHarness::new(FakeCompiler::default(), &["470.82.01", "535.129.03"]).await;

    let report = harness
        .builder
        .process(
            vec![record("470.82.01"), record("525.125.06"), record("535.129.03")],
            false,
            CancellationToken::new(),
        )
        .await;

    let outcomes = report.outcomes();
    assert_eq!(outcomes[0], &Outcome::Succeeded);
    assert!(matches!(outcomes[1], Outcome::Failed(_)));
    assert_eq!(outcomes[2], &Outcome::Succeeded);

    assert!(harness.published("470.82.01").await.is_some());
    assert!(harness.published("525.125.06").await.is_none());
    assert!(harness.published("535.129.03").await.is_some());
}

#[tokio::test]
async fn second_run_skips_everything() {
    let harness = TestHarness::new(FakeCompiler::default(), &["470.82.01", "535.129.03"]).await;
    let records = vec![record("470.82.01"), record("535.129.03")];

    let first = harness
        .builder
        .process(records.clone(), false, CancellationToken::new())
        .await;
    assert_eq!(first.succeeded(), 2);

    let second = harness
        .builder
        .process(records, false, CancellationToken::new())
        .await;

    assert_eq!(second.skipped(), 2);
    assert_eq!(harness.compiler.work_dirs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn dry_run_does_not_publish() {
    let harness = TestHarness::new(FakeCompiler::default(), &["470.82.01"]).await;

    for _ in 0..2 {
        let report = harness
            .builder
            .process(vec![record("470.82.01")], true, CancellationToken::new())
            .await;

        // Nothing was uploaded by the previous run, so it is never seen as already built.
        assert_eq!(report.outcomes(), vec![&Outcome::Succeeded]);
        assert!(harness.published("470.82.01").await.is_none());
    }
}

#[tokio::test]
async fn work_dirs_are_removed() {
    let harness = TestHarness::new(FakeCompiler::default(), &["470.82.01", "535.129.03"]).await;

    harness
        .builder
        .process(
            vec![record("470.82.01"), record("525.125.06"), record("535.129.03")],
            false,
            CancellationToken::new(),
        )
        .await;

    let work_dirs = harness.compiler.work_dirs.lock().unwrap().clone();
    assert_eq!(work_dirs.len(), 2);
    assert_ne!(work_dirs[0], work_dirs[1]);
    assert!(work_dirs.iter().all(|dir| !dir.exists()));
    assert!(harness.work_root_is_empty());
}

#[tokio::test]
async fn compile_failure_publishes_nothing() {
    let harness = TestHarness::new(
        FakeCompiler {
            fail: true,
            ..Default::default()
        },
        &["470.82.01"],
    )
    .await;

    let report = harness
        .builder
        .process(vec![record("470.82.01")], false, CancellationToken::new())
        .await;

    assert_eq!(report.failed(), 1);
    assert!(harness.published("470.82.01").await.is_none());
    assert!(harness.work_root_is_empty());
}

#[tokio::test]
async fn panicking_record_is_contained() {
    let harness = TestHarness::new(
        FakeCompiler {
            panic_on: Some("NVIDIA-Linux-x86_64-470.82.01.run".into()),
            ..Default::default()
        },
        &["470.82.01", "535.129.03"],
    )
    .await;

    let report = harness
        .builder
        .process(
            vec![record("470.82.01"), record("535.129.03")],
            false,
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(report.outcomes()[0], Outcome::Failed(_)));
    assert_eq!(report.outcomes()[1], &Outcome::Succeeded);
    assert!(harness.work_root_is_empty());
}

#[tokio::test]
async fn cancelled_batch_is_interrupted() {
    let harness = TestHarness::new(FakeCompiler::default(), &["470.82.01", "535.129.03"]).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = harness
        .builder
        .process(vec![record("470.82.01"), record("535.129.03")], false, cancel)
        .await;

    assert_eq!(report.interrupted(), 2);
    assert!(harness.compiler.work_dirs.lock().unwrap().is_empty());
}

#[tokio::test]
/// Cancelling mid-batch fails the record in flight and never starts the rest.
async fn cancellation_during_build() {
    let harness = TestHarness::new(
        FakeCompiler {
            cancel_batch: true,
            ..Default::default()
        },
        &["470.82.01", "535.129.03"],
    )
    .await;

    let report = harness
        .builder
        .process(
            vec![record("470.82.01"), record("535.129.03")],
            false,
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(report.outcomes()[0], Outcome::Failed(_)));
    assert_eq!(report.outcomes()[1], &Outcome::Interrupted);
    assert!(harness.work_root_is_empty());
}

#[tokio::test]
async fn parallel_batch_keeps_input_order() {
    let drivers = ["470.82.01", "525.125.06", "535.129.03", "550.54.15"];
    let mut harness = TestHarness::new(FakeCompiler::default(), &drivers).await;
    harness.builder.config.parallelism = 3;

    let report = harness
        .builder
        .process(
            drivers.iter().map(|d| record(d)).collect(),
            false,
            CancellationToken::new(),
        )
        .await;

    let got: Vec<&str> = report
        .records
        .iter()
        .map(|r| r.driver_version.as_str())
        .collect();
    assert_eq!(got, drivers.to_vec());
    assert_eq!(report.succeeded(), 4);
}

/// Answers every existence check with an error; everything else goes to the in-memory engine.
#[derive(Debug)]
struct ExistsFails(Arc<memory::Engine>);

#[async_trait]
impl ObjectStore for ExistsFails {
    async fn exists(&self, _uri: &str) -> Result<bool, ObjectStoreError> {
        Err(ObjectStoreError::Connection("deadline exceeded".into()))
    }

    async fn get(&self, uri: &str) -> Result<Bytes, ObjectStoreError> {
        self.0.get(uri).await
    }

    async fn get_stream(&self, uri: &str) -> Result<ByteStream, ObjectStoreError> {
        self.0.get_stream(uri).await
    }

    async fn put(&self, uri: &str, content: Bytes) -> Result<(), ObjectStoreError> {
        self.0.put(uri, content).await
    }

    async fn put_stream(&self, uri: &str, content: UploadStream) -> Result<(), ObjectStoreError> {
        self.0.put_stream(uri, content).await
    }

    async fn delete(&self, uri: &str) -> Result<(), ObjectStoreError> {
        self.0.delete(uri).await
    }

    async fn list_prefixes(
        &self,
        bucket: &str,
        start_offset: &str,
    ) -> Result<Vec<String>, ObjectStoreError> {
        self.0.list_prefixes(bucket, start_offset).await
    }
}

#[tokio::test]
/// An existence check that errors is treated as "not built" and the record is rebuilt.
async fn failed_existence_check_still_builds() {
    let seeded = TestHarness::new(FakeCompiler::default(), &["470.82.01"]).await;
    seeded
        .store
        .put(
            &record("470.82.01").output_driver_uri(),
            Bytes::from("previous build"),
        )
        .await
        .unwrap();

    let store = seeded.store.clone();
    let harness = TestHarness::with_store(
        store.clone(),
        Arc::new(ExistsFails(store)),
        FakeCompiler::default(),
    );

    let report = harness
        .builder
        .process(vec![record("470.82.01")], false, CancellationToken::new())
        .await;

    assert_eq!(report.outcomes(), vec![&Outcome::Succeeded]);
    assert_eq!(
        harness.published("470.82.01").await.unwrap(),
        Bytes::from("custom NVIDIA-Linux-x86_64-470.82.01.run")
    );
}
