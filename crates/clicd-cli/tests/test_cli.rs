use assert_cmd::Command;
use predicates::prelude::*;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

fn write_interactions(path: &Path) {
    let mut text = String::from("user\titem\ttimestamp\n");
    for user in 1..=6u32 {
        for t in 0..10u32 {
            writeln!(text, "{user}\t{}\t{t}", 1 + (3 * user + t) % 16).unwrap();
        }
    }
    fs::write(path, text).unwrap();
}

fn write_config(path: &Path, checkpoint_dir: &Path) {
    let config = format!(
        r#"{{
  "model": {{ "hidden_size": 8, "n_layers": 1, "n_heads": 2, "inner_size": 16, "max_seq_length": 6 }},
  "trainer": {{ "epochs": 1, "train_batch_size": 8, "eval_batch_size": 64, "checkpoint_dir": {:?} }},
  "sim_top_k": 2
}}"#,
        checkpoint_dir.display().to_string()
    );
    fs::write(path, config).unwrap();
}

#[test]
fn test_cli_build_graphs() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("toy.tsv");
    let output = dir.path().join("graphs.json");
    write_interactions(&input);

    let mut cmd = Command::cargo_bin("clicd")?;
    cmd.arg("build-graphs").arg("--input").arg(&input).arg("-o").arg(&output).arg("--top-k").arg("2");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Saved graphs"));

    let graphs: serde_json::Value = serde_json::from_str(&fs::read_to_string(&output)?)?;
    assert!(graphs.get("adjacency").is_some());
    assert!(graphs.get("similarity").is_some());
    Ok(())
}

#[test]
fn test_cli_train_then_evaluate() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("toy.tsv");
    let config = dir.path().join("run.json");
    let saved = dir.path().join("saved");
    write_interactions(&input);
    write_config(&config, &saved);

    let mut cmd = Command::cargo_bin("clicd")?;
    cmd.arg("train").arg("--input").arg(&input).arg("--config").arg(&config);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Best valid score"))
        .stdout(predicate::str::contains("mrr@10"));

    let checkpoint = saved.join("CLICD-toy.ckpt");
    assert!(checkpoint.exists());

    let mut cmd = Command::cargo_bin("clicd")?;
    cmd.arg("evaluate")
        .arg("--input")
        .arg(&input)
        .arg("--checkpoint")
        .arg(&checkpoint)
        .arg("--config")
        .arg(&config);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Test result"));
    Ok(())
}

#[test]
fn test_cli_meta_train() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("toy.tsv");
    let config = dir.path().join("run.json");
    write_interactions(&input);
    let meta = dir.path().join("meta.json");
    write_config(&config, &dir.path().join("saved"));
    fs::write(
        &meta,
        r#"{ "meta_task_lengths": { "fixed": [2] }, "meta_pretrain_step": 1, "meta_batch_size": 4, "meta_shots": 8 }"#,
    )?;

    let mut cmd = Command::cargo_bin("clicd")?;
    cmd.arg("train")
        .arg("--input")
        .arg(&input)
        .arg("--config")
        .arg(&config)
        .arg("--meta-config")
        .arg(&meta);
    cmd.assert().success().stdout(predicate::str::contains("Test result"));
    Ok(())
}

#[test]
fn test_cli_missing_checkpoint_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("toy.tsv");
    write_interactions(&input);

    let mut cmd = Command::cargo_bin("clicd")?;
    cmd.arg("evaluate")
        .arg("--input")
        .arg(&input)
        .arg("--checkpoint")
        .arg(dir.path().join("nope.ckpt"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to evaluate"));
    Ok(())
}
