use std::path::Path;

use color_eyre::{Result, eyre::ensure};
use mason::{assembly::Assembler, defs::BuildMode, error::Fault, repos};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::{chunk, registry, test_settings};

async fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let status = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .await?;
    ensure!(status.success(), "git {args:?} failed in {dir:?}");
    Ok(())
}

/// Initialise a commit in `dir` and return its hash.
async fn seed_upstream(dir: &Path) -> Result<String> {
    std::fs::create_dir_all(dir)?;
    git(dir, &["init", "--quiet", "."]).await?;
    std::fs::write(dir.join("hello.txt"), "upstream\n")?;
    git(dir, &["add", "hello.txt"]).await?;
    git(
        dir,
        &[
            "-c",
            "user.name=mason",
            "-c",
            "user.email=mason@example.org",
            "commit",
            "--quiet",
            "-m",
            "seed",
        ],
    )
    .await?;

    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .await?;
    ensure!(output.status.success(), "rev-parse failed");
    Ok(String::from_utf8(output.stdout)?.trim().to_string())
}

#[test_log::test(tokio::test)]
async fn sources_resolve_mirror_and_check_out() -> Result<()> {
    let root = TempDir::new()?;
    let upstream = root.path().join("upstream");
    let commit = seed_upstream(&upstream).await?;
    let repo = format!("file://{}", upstream.display());

    let settings = test_settings(root.path());
    let mut widget = chunk("widget");
    widget.build_mode = BuildMode::Bootstrap;
    widget.repo = Some(repo.clone());
    widget.reference = Some(commit);
    widget.steps.insert(
        String::from("install-commands"),
        vec![String::from("cp hello.txt \"$DESTDIR/\"")],
    );

    let assembler = Assembler::new(settings, registry(vec![widget])).await?;
    let key = assembler.run("widget").await?.expect("built");

    let unpacked = assembler.store().unpack(&key).await?;
    assert_eq!(
        std::fs::read_to_string(unpacked.join("hello.txt"))?,
        "upstream\n",
    );

    // The mirror is shared state under the sanitised remote name.
    let mirror = root.path().join("gits").join(repos::repo_name(&repo));
    assert!(mirror.join("HEAD").exists(), "bare mirror exists at {mirror:?}");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn resolved_trees_are_stable_across_engines() -> Result<()> {
    let root = TempDir::new()?;
    let upstream = root.path().join("upstream");
    let commit = seed_upstream(&upstream).await?;
    let repo = format!("file://{}", upstream.display());

    let settings = test_settings(root.path());
    let mut widget = chunk("widget");
    widget.repo = Some(repo);
    widget.reference = Some(commit);
    let catalogue = vec![widget];

    // Key computation resolves the tree; a second engine must agree, and
    // by then the mirror already exists so no network is involved.
    let first = Assembler::new(settings.clone(), registry(catalogue.clone())).await?;
    let second = Assembler::new(settings, registry(catalogue)).await?;
    assert_eq!(
        first.keys().of("widget").await?,
        second.keys().of("widget").await?,
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unresolvable_refs_are_fatal_and_write_nothing() -> Result<()> {
    let root = TempDir::new()?;
    let upstream = root.path().join("upstream");
    seed_upstream(&upstream).await?;
    let repo = format!("file://{}", upstream.display());

    let settings = test_settings(root.path());
    let mut widget = chunk("widget");
    widget.repo = Some(repo.clone());
    widget.reference = Some(String::from("nonexistent"));

    let assembler = Assembler::new(settings, registry(vec![widget])).await?;
    let err = assembler
        .run("widget")
        .await
        .expect_err("an unresolvable ref is fatal");

    let fault = err.downcast_ref::<Fault>().expect("fault in report");
    assert!(
        matches!(
            fault,
            Fault::SourceUnresolvable { repo: r, reference } if *r == repo && reference == "nonexistent"
        ),
        "unexpected fault: {fault:?}",
    );

    let artifacts = std::fs::read_dir(root.path().join("artifacts"))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tar.gz"))
        .count();
    assert_eq!(artifacts, 0, "no artifact may be written");
    Ok(())
}
