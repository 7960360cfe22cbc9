use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use amigo_vision::config::PipelineConfig;
use amigo_vision::{PipelineMode, PixelFormat};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "AMIGO_CONFIG",
        "AMIGO_SOURCE_URI",
        "AMIGO_MODEL_PATH",
        "AMIGO_LABELS_PATH",
        "AMIGO_LABELS",
        "AMIGO_BACKEND",
        "AMIGO_DWELL_FRAMES",
        "AMIGO_MIN_CONFIDENCE",
        "AMIGO_PIPELINE_MODE",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let labels_path = file.path().with_extension("labels");
    let json = format!(
        r#"{{
            "source": {{
                "uri": "/dev/video2",
                "target_fps": 20,
                "width": 640,
                "height": 480,
                "pixel_format": "yuyv"
            }},
            "model": {{
                "backend": "stub",
                "labels_path": "{}",
                "input_width": 96,
                "input_height": 96
            }},
            "aggregator": {{
                "dwell_frames": 8,
                "smoothing": 0.5
            }},
            "pipeline": {{
                "mode": "sequential",
                "stall_frames": 4,
                "capture_backoff_ms": 50,
                "capture_backoff_max_ms": 800
            }}
        }}"#,
        labels_path.display()
    );
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("AMIGO_CONFIG", file.path());
    std::env::set_var("AMIGO_SOURCE_URI", "stub://lobby");
    std::env::set_var("AMIGO_DWELL_FRAMES", "3");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.source.uri, "stub://lobby");
    assert_eq!(cfg.source.target_fps, 20);
    assert_eq!((cfg.source.width, cfg.source.height), (640, 480));
    assert_eq!(cfg.source.pixel_format, PixelFormat::Yuyv);
    assert_eq!(cfg.model.labels_path.unwrap(), labels_path);
    assert_eq!((cfg.model.input_width, cfg.model.input_height), (96, 96));
    assert_eq!(cfg.aggregator.dwell_frames, 3);
    assert_eq!(cfg.aggregator.smoothing, 0.5);
    assert_eq!(cfg.aggregator.min_confidence, 0.5);
    assert_eq!(cfg.runtime.mode, PipelineMode::Sequential);
    assert_eq!(cfg.runtime.stall_frames, 4);
    assert_eq!(cfg.runtime.capture_backoff, Duration::from_millis(50));
    assert_eq!(cfg.runtime.capture_backoff_max, Duration::from_millis(800));
    assert_eq!(cfg.runtime.frame_interval, Duration::from_millis(50));
    assert_eq!(cfg.runtime.stall_timeout(), Duration::from_millis(200));

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [source]
        uri = "stub://garden"
        realtime = false
        max_frames = 90

        [model]
        labels = ["sparrow", "robin", "empty"]
        activation = "softmax"

        [pipeline]
        mode = "threaded"
        max_inference_failures = 3
    "#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = PipelineConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.source.uri, "stub://garden");
    assert!(!cfg.source.realtime);
    assert_eq!(cfg.source.max_frames, Some(90));
    assert_eq!(
        cfg.model.labels.as_deref(),
        Some(&["sparrow".to_string(), "robin".to_string(), "empty".to_string()][..])
    );
    assert_eq!(cfg.runtime.mode, PipelineMode::Threaded);
    assert_eq!(cfg.runtime.max_inference_failures, 3);
    assert_eq!(cfg.aggregator.dwell_frames, 5);

    clear_env();
}

#[test]
fn env_only_config_uses_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AMIGO_LABELS", "open, closed ,,ajar");
    std::env::set_var("AMIGO_PIPELINE_MODE", "Sequential");
    std::env::set_var("AMIGO_MIN_CONFIDENCE", "0.7");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.source.uri, "stub://camera");
    assert_eq!(cfg.model.backend, "stub");
    assert_eq!(
        cfg.model.labels,
        Some(vec!["open".to_string(), "closed".to_string(), "ajar".to_string()])
    );
    assert_eq!(cfg.runtime.mode, PipelineMode::Sequential);
    assert!((cfg.aggregator.min_confidence - 0.7).abs() < 1e-6);

    clear_env();
}

#[test]
fn invalid_env_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AMIGO_DWELL_FRAMES", "many");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("AMIGO_DWELL_FRAMES", "0");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("AMIGO_MIN_CONFIDENCE", "1.5");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("AMIGO_PIPELINE_MODE", "parallel");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("AMIGO_BACKEND", "tract");
    assert!(PipelineConfig::load().is_err());
    clear_env();
}

#[test]
fn malformed_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ \"source\": { \"target_fps\": \"fast\" } }")
        .expect("write config");

    let err = PipelineConfig::load_from(Some(file.path())).expect_err("invalid config");
    assert!(err.to_string().contains("invalid config file"));

    let missing = file.path().with_extension("missing");
    assert!(PipelineConfig::load_from(Some(&missing)).is_err());

    clear_env();
}
