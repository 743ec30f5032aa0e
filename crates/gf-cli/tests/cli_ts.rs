use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_gammafit"))
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

/// Full-sky nside-16 maps with a mild excess everywhere.
fn write_document(dir: &Path) -> PathBuf {
    let npix = 12 * 16 * 16;
    let doc = serde_json::json!({
        "response": {
            "log_energy_bins": [-0.5, 0.0, 0.5, 1.0],
            "dec_bands": [{
                "lower": -30.0, "upper": 60.0, "sim_dec": 20.0,
                "bins": {
                    "1": {
                        "signal": [8.0, 6.0, 4.0, 2.0],
                        "background": 1000.0,
                        "psf": {"type": "double_gaussian", "fraction": 1.0, "sigma1": 0.5, "sigma2": 0.5}
                    }
                }
            }]
        },
        "maps": {
            "nside": 16,
            "bins": {"1": {"on": vec![12.0; npix], "background": vec![10.0; npix]}}
        },
        "sources": {
            "point_sources": [{"name": "crab", "ra": 83.63, "dec": 22.01}]
        },
        "session": {
            "fixed_roi": {"type": "disc", "ra": 83.63, "dec": 22.01, "radius": 6.0}
        }
    });
    let path = dir.join("analysis.json");
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    path
}

#[test]
fn ts_writes_json_to_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_document(dir.path());
    let out = run(&["ts", "--input", input.to_string_lossy().as_ref(), "--threads", "1"]);
    assert!(out.status.success(), "ts should succeed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("stdout should be JSON");
    let ts = v.get("ts").and_then(|x| x.as_f64()).expect("ts should be a number");
    assert!(ts.is_finite() && ts >= 0.0, "ts = {ts}");
    for key in ["log_likelihood", "background_log_likelihood", "significance", "common_norm"] {
        let x = v.get(key).and_then(|x| x.as_f64()).unwrap_or_else(|| panic!("{key} should be a number"));
        assert!(x.is_finite(), "{key} = {x}");
    }
    assert!(v.get("converged").and_then(|x| x.as_bool()).is_some());
    assert!(v.get("model_fit").is_some());
}

#[test]
fn ts_without_internal_fit_writes_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_document(dir.path());
    let output = dir.path().join("ts.json");
    let out = run(&[
        "ts",
        "--input",
        input.to_string_lossy().as_ref(),
        "--output",
        output.to_string_lossy().as_ref(),
        "--no-internal-fit",
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(v.get("common_norm").and_then(|x| x.as_f64()), Some(1.0));
    assert!(v.get("model_fit").unwrap().is_null());
}

#[test]
fn estimate_reports_norm_and_sigma() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_document(dir.path());
    let out = run(&["estimate", "--input", input.to_string_lossy().as_ref()]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let norm = v.get("norm").and_then(|x| x.as_f64()).expect("norm");
    let sigma = v.get("sigma").and_then(|x| x.as_f64()).expect("sigma");
    assert!(norm.is_finite() && norm > 0.0);
    assert!(sigma.is_finite() && sigma > 0.0);
}

#[test]
fn missing_input_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.json");
    let out = run(&["ts", "--input", missing.to_string_lossy().as_ref()]);
    assert!(!out.status.success());
}
