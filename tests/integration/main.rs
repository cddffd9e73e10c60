//! Integration tests for commune

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use commune::Checksum;
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn commune(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("commune");
        cmd.env("COMMUNE_CONFIG", temp.path().join("config.toml"))
            .env_remove("COMMUNE_COMMUNION_PORT")
            .env_remove("COMMUNE_COMMUNION_PEERS")
            .env_remove("COMMUNE_COMMUNION_ID")
            .env_remove("COMMUNE_LOCAL_CORES");
        cmd
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        commune(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("content-addressed transformation cache"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        commune(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("commune"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        commune(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        commune(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[communion.master]"));
    }

    #[test]
    fn config_init_then_refuse_overwrite() {
        let temp = TempDir::new().unwrap();
        commune(&temp).args(["config", "init"]).assert().success();
        assert!(temp.path().join("config.toml").exists());

        commune(&temp)
            .args(["config", "init"])
            .assert()
            .success()
            .stderr(predicate::str::contains("--force"));
    }

    #[test]
    fn invalid_config_fails_with_hint() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[general]\nlog_format = \"xml\"\n")
            .unwrap();
        commune(&temp)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn checksum_of_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("hello.txt");
        std::fs::write(&file, b"hello").unwrap();

        commune(&temp)
            .arg("checksum")
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains(Checksum::digest(b"hello").to_hex()));
    }

    #[test]
    fn run_computes_locally() {
        let temp = TempDir::new().unwrap();
        let code = temp.path().join("double.sh");
        let input = temp.path().join("a.txt");
        let output = temp.path().join("out.txt");
        std::fs::write(&code, "echo -n $((a * 2))\n").unwrap();
        std::fs::write(&input, "21\n").unwrap();

        commune(&temp)
            .args(["run", "--cores", "1", "--code"])
            .arg(&code)
            .arg("--input")
            .arg(format!("a={}", input.display()))
            .arg("--output")
            .arg(&output)
            .assert()
            .success()
            .stdout(predicate::str::contains(Checksum::digest(b"42").to_hex()));
        assert_eq!(std::fs::read(&output).unwrap(), b"42");
    }

    #[test]
    fn failing_run_reports_error() {
        let temp = TempDir::new().unwrap();
        let code = temp.path().join("fail.sh");
        std::fs::write(&code, "echo oops >&2; exit 4\n").unwrap();

        commune(&temp)
            .args(["run", "--cores", "1", "--code"])
            .arg(&code)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Transformation failed"))
            .stderr(predicate::str::contains("oops"));
    }

    #[test]
    fn worker_answers_on_stdout_without_reading_config() {
        use commune::job::worker::{WorkerPin, WorkerRequest};
        use commune::transformation::OutputPin;
        use std::collections::BTreeMap;

        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "not = [valid toml\n").unwrap();
        let mut pins = BTreeMap::new();
        pins.insert(
            "code".to_string(),
            WorkerPin {
                celltype: "bash".to_string(),
                subcelltype: None,
                buffer: hex::encode("echo -n hi"),
            },
        );
        let request = WorkerRequest {
            transformation: Checksum::digest(b"echo -n hi"),
            language: Some("bash".to_string()),
            output: OutputPin::new("result", "text"),
            meta: None,
            env: None,
            as_map: None,
            pins,
        };

        commune(&temp)
            .arg("worker")
            .write_stdin(serde_json::to_vec(&request).unwrap())
            .assert()
            .success()
            .stdout(predicate::str::contains("\"kind\":\"result\""))
            .stdout(predicate::str::contains(hex::encode("hi")));
    }

    #[test]
    fn no_cores_and_no_peers() {
        let temp = TempDir::new().unwrap();
        let code = temp.path().join("noop.sh");
        std::fs::write(&code, "true\n").unwrap();

        commune(&temp)
            .args(["run", "--cores", "0", "--code"])
            .arg(&code)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Local execution unavailable"));
    }
}

mod communion_tests {
    use commune::communion::{BufferStatus, Capabilities, Capability};
    use commune::config::Config;
    use commune::job::worker::ProcessLauncher;
    use commune::transformation::{OutputPin, Pin, Transformation};
    use commune::{Checksum, Instance};
    use std::sync::Arc;
    use std::time::Duration;

    fn config(id: &str) -> Config {
        let mut config = Config::default();
        config.communion.id = Some(id.to_string());
        config.communion.listen_port = Some(0);
        config.communion.round_trip_timeout_secs = 2.0;
        config.cache.keep_alive_secs = 1.0;
        config
    }

    async fn start(config: &Config) -> Instance {
        let launcher = ProcessLauncher::new(env!("CARGO_BIN_EXE_commune"), vec!["worker".into()]);
        Instance::start_with(config, Arc::new(launcher)).await.unwrap()
    }

    /// Dial `servant` from `master` and wait until both sides see the link
    async fn link(master: &Instance, servant: &Instance) {
        let addr = servant.listen_addr().unwrap().to_string();
        master.connect(&addr).await.unwrap();
        for _ in 0..100 {
            if !servant.server().peers().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("link never registered on the accepting side");
    }

    #[tokio::test]
    async fn buffers_are_shared() {
        let mut a_config = config("a");
        a_config.communion.servant.buffer = Capability::On;
        a_config.communion.servant.buffer_status = Capability::On;
        let a = start(&a_config).await;
        let b = start(&config("b")).await;
        link(&b, &a).await;

        let checksum = a.put_buffer(b"hello".to_vec()).await.unwrap();
        let status = b
            .cache()
            .clients()
            .remote_buffer_status(checksum, None, false)
            .await;
        assert_eq!(status, BufferStatus::Local);
        assert_eq!(b.buffer(checksum).await.unwrap(), Some(b"hello".to_vec()));

        let missing = Checksum::digest(b"nobody has this");
        assert_eq!(b.buffer(missing).await.unwrap(), None);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn default_servant_keeps_buffers_private() {
        let a = start(&config("a")).await;
        let b = start(&config("b")).await;
        link(&b, &a).await;

        let checksum = a.put_buffer(b"secret".to_vec()).await.unwrap();
        assert_eq!(b.buffer(checksum).await.unwrap(), None);
    }

    #[tokio::test]
    async fn job_runs_on_the_servant() {
        let mut a_config = config("a");
        a_config.communion.servant = Capabilities::all();
        a_config.execution.local_cores = 1;
        let a = start(&a_config).await;

        let mut b_config = config("b");
        b_config.communion.master = Capabilities::all();
        b_config.communion.servant.buffer = Capability::On;
        b_config.communion.servant.buffer_status = Capability::On;
        b_config.execution.local_cores = 0;
        let b = start(&b_config).await;
        link(&b, &a).await;

        let code = b
            .put_buffer(b"echo -n $((a * 2)) # double it\n".to_vec())
            .await
            .unwrap();
        let input = b.put_buffer(b"21".to_vec()).await.unwrap();
        let tf = Transformation::new(OutputPin::new("result", "text"))
            .with_language("bash")
            .with_pin("code", Pin::new("bash", code))
            .with_pin("a", Pin::new("text", input));

        let result = tokio::time::timeout(Duration::from_secs(60), b.compute(tf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Checksum::digest(b"42"));
        assert_eq!(b.buffer(result).await.unwrap(), Some(b"42".to_vec()));
        assert_eq!(a.cache().jobs_created(), 1);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn clear_exception_reaches_the_servant() {
        let mut a_config = config("a");
        a_config.communion.servant = Capabilities::all();
        a_config.execution.local_cores = 1;
        let a = start(&a_config).await;

        let mut b_config = config("b");
        b_config.communion.master = Capabilities::all();
        b_config.communion.servant.buffer = Capability::On;
        b_config.communion.servant.buffer_status = Capability::On;
        b_config.execution.local_cores = 0;
        let b = start(&b_config).await;
        link(&b, &a).await;

        let code = b
            .put_buffer(b"echo broken >&2; exit 3\n".to_vec())
            .await
            .unwrap();
        let tf = Transformation::new(OutputPin::new("result", "text"))
            .with_language("bash")
            .with_pin("code", Pin::new("bash", code));
        let (checksum, consumer) = b.cache().register_transformation(tf, None).await.unwrap();
        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            b.cache().run_transformation(checksum),
        )
        .await
        .unwrap();
        assert!(outcome.is_err());
        assert!(wait_until(|| a.cache().exception(&checksum).is_some()).await);

        b.cache().clear_exception(checksum);
        assert!(wait_until(|| a.cache().exception(&checksum).is_none()).await);
        assert!(b.cache().exception(&checksum).is_none());

        b.cache().release_transformation(checksum, &consumer);
        a.shutdown();
        b.shutdown();
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}
