use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn course_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("pipelines/course.yaml")
}

fn bin() -> Command {
    Command::cargo_bin("pipeline-composer").expect("binary present")
}

#[test]
fn synth_writes_one_template_per_stack() {
    let temp = tempdir().unwrap();
    let out = temp.path().join("templates");
    let summary = temp.path().join("summary.json");

    bin()
        .arg("synth")
        .arg(course_config())
        .arg("--output-dir")
        .arg(&out)
        .arg("--summary-json")
        .arg(&summary)
        .assert()
        .success();

    for stack in ["PipelineStack", "ServiceStackTest", "ServiceStackProd", "BillingStack"] {
        let path = out.join(format!("{stack}.template.json"));
        assert!(path.is_file(), "missing {}", path.display());
    }

    let pipeline: Value =
        serde_json::from_str(&fs::read_to_string(out.join("PipelineStack.template.json")).unwrap())
            .unwrap();
    assert_eq!(
        pipeline["Resources"]["Pipeline"]["Type"],
        "AWS::CodePipeline::Pipeline"
    );

    let summary: Value = serde_json::from_str(&fs::read_to_string(&summary).unwrap()).unwrap();
    assert_eq!(summary["stage_count"], 5);
    assert_eq!(summary["production_services"], 1);
}

#[test]
fn plan_prints_run_order_waves() {
    let output = bin()
        .arg("plan")
        .arg(course_config())
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("4. Test"));
    assert!(stdout.contains("[2] Integration_Test"));
}

#[test]
fn validate_fails_on_invalid_config() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("broken.yaml");
    fs::write(
        &path,
        "version: 1\nsources: []\nservices:\n  - label: Test\n",
    )
    .unwrap();

    bin().arg("validate").arg(&path).assert().failure();
    bin().arg("validate").arg(course_config()).assert().success();
}

#[test]
fn lint_expands_glob_patterns() {
    let temp = tempdir().unwrap();
    fs::copy(course_config(), temp.path().join("a.yaml")).unwrap();
    fs::copy(course_config(), temp.path().join("b.yaml")).unwrap();
    let pattern = temp.path().join("*.yaml");

    bin()
        .arg("lint")
        .arg(pattern.to_string_lossy().to_string())
        .assert()
        .success();

    fs::write(temp.path().join("c.yaml"), "version: 3\nsources: []\n").unwrap();
    bin()
        .arg("lint")
        .arg(pattern.to_string_lossy().to_string())
        .assert()
        .failure();
}

#[test]
fn diff_reports_changed_stages() {
    let temp = tempdir().unwrap();
    let changed = temp.path().join("changed.yaml");
    let content = fs::read_to_string(course_config())
        .unwrap()
        .replace("integration_test: true", "integration_test: false");
    fs::write(&changed, content).unwrap();

    bin()
        .arg("diff")
        .arg(course_config())
        .arg(course_config())
        .assert()
        .success();

    let output = bin()
        .arg("diff")
        .arg(course_config())
        .arg(&changed)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Action 'Test/Integration_Test' only in left config"));
}

#[test]
fn init_then_lock_round_trip() {
    let temp = tempdir().unwrap();
    let config = temp.path().join("pipelines").join("single.yaml");
    let lock = temp.path().join("locks").join("single.lock");

    bin()
        .args(["init", "--preset", "single", "--output"])
        .arg(&config)
        .assert()
        .success();
    assert!(config.is_file());

    bin().arg("lock").arg(&config).arg(&lock).assert().success();
    let content = fs::read_to_string(&lock).unwrap();
    assert!(content.contains("pipeline: SinglePipeline"));
    assert!(content.contains("name: Billing_Update"));
}

#[test]
fn resolve_substitutes_deployed_exports() {
    let temp = tempdir().unwrap();
    let out = temp.path().join("templates");
    bin()
        .arg("synth")
        .arg(course_config())
        .arg("--output-dir")
        .arg(&out)
        .assert()
        .success();

    let template = out.join("PipelineStack.template.json");
    let exports = temp.path().join("exports.yaml");
    fs::write(
        &exports,
        "ServiceStackTest:\n  ServiceEndpointTest: https://test.example.com\n",
    )
    .unwrap();
    let resolved = temp.path().join("resolved.json");

    bin()
        .arg("resolve")
        .arg(&template)
        .arg("--exports")
        .arg(&exports)
        .arg("--output")
        .arg(&resolved)
        .assert()
        .success();
    let content = fs::read_to_string(&resolved).unwrap();
    assert!(content.contains("https://test.example.com"));
    assert!(!content.contains("Fn::ImportValue"));

    let missing = temp.path().join("missing.yaml");
    fs::write(&missing, "{}\n").unwrap();
    bin()
        .arg("resolve")
        .arg(&template)
        .arg("--exports")
        .arg(&missing)
        .assert()
        .failure();
}

#[test]
fn completions_are_generated() {
    let output = bin().args(["completions", "bash"]).output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("pipeline-composer"));
}
