use std::time::Duration;

use color_eyre::Result;
use mason::{
    assembly::Assembler,
    defs::{BuildMode, Kind},
    error::Fault,
    fs::Lockfile,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::{chunk, registry, test_settings};

#[test_log::test(tokio::test)]
async fn bootstrap_chunk_builds_and_caches() -> Result<()> {
    let root = TempDir::new()?;
    let settings = test_settings(root.path());

    let mut widget = chunk("widget");
    widget.build_mode = BuildMode::Bootstrap;
    widget.steps.insert(
        String::from("install-commands"),
        vec![String::from("echo built > \"$DESTDIR/hello\"")],
    );

    let assembler = Assembler::new(settings, registry(vec![widget])).await?;
    let key = assembler.run("widget").await?.expect("built on this host");

    assert!(key.as_str().starts_with("widget@"), "key names the chunk");
    let blob = assembler.store().get(&key).await?.expect("artifact stored");
    assert!(blob.ends_with(format!("{key}.tar.gz")));

    let unpacked = assembler.store().unpack(&key).await?;
    let greeting = std::fs::read_to_string(unpacked.join("hello"))?;
    assert_eq!(greeting, "built\n");
    assert!(
        unpacked.join("mason/widget.meta").exists(),
        "artifact carries its metadata file",
    );

    let log = std::fs::read_to_string(assembler.store().log_path(&key))?;
    assert!(
        log.contains("# # echo built > \"$DESTDIR/hello\""),
        "log carries the command header: {log}",
    );
    assert!(
        !log.contains("linux-user-chroot"),
        "bootstrap builds run without a chroot",
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn second_run_finds_everything_cached() -> Result<()> {
    let root = TempDir::new()?;
    let settings = test_settings(root.path());

    let mut widget = chunk("widget");
    widget.build_mode = BuildMode::Bootstrap;
    widget.steps.insert(
        String::from("install-commands"),
        vec![String::from("echo built > \"$DESTDIR/hello\"")],
    );
    let catalogue = vec![widget];

    let first = Assembler::new(settings.clone(), registry(catalogue.clone())).await?;
    let key = first.run("widget").await?.expect("first build");

    // A fresh assembler recomputes keys from scratch but must find every
    // artifact and perform zero builds.
    let second = Assembler::new(settings, registry(catalogue)).await?;
    let rerun = second.run("widget").await?.expect("cache hit");
    assert_eq!(key, rerun);

    let log = std::fs::read_to_string(second.store().log_path(&key))?;
    assert_eq!(
        log.matches("# # elapsed:").count(),
        1,
        "the second run must not build again",
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn stratum_assembles_contents_and_excludes_bootstrap_children() -> Result<()> {
    let root = TempDir::new()?;
    let settings = test_settings(root.path());

    let libc = chunk("libc");
    let coreutils = chunk("coreutils");
    let mut stage0 = chunk("stage0");
    stage0.build_mode = BuildMode::Bootstrap;

    let mut core = chunk("core");
    core.kind = Kind::Stratum;
    core.contents = vec![
        String::from("libc"),
        String::from("coreutils"),
        String::from("stage0"),
    ];

    let assembler =
        Assembler::new(settings, registry(vec![libc, coreutils, stage0, core])).await?;
    let key = assembler.run("core").await?.expect("stratum built");

    for name in ["libc", "coreutils"] {
        let content_key = assembler.keys().of(name).await?;
        assert!(
            assembler.store().get(&content_key).await?.is_some(),
            "content '{name}' must be assembled before the stratum",
        );
    }

    // Bootstrap-mode children fold into the cache key but are neither
    // preinstalled nor built through the contents walk.
    let stage0_key = assembler.keys().of("stage0").await?;
    assert_eq!(assembler.store().get(&stage0_key).await?, None);

    let unpacked = assembler.store().unpack(&key).await?;
    assert!(unpacked.join("mason/core.meta").exists());
    assert!(
        !unpacked.join("hello").exists(),
        "content files live in the assembly, not the stratum artifact",
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn shared_dependencies_preinstall_once() -> Result<()> {
    let root = TempDir::new()?;
    let settings = test_settings(root.path());

    let base = chunk("base");
    let mut tool = chunk("tool");
    tool.build_depends = vec![String::from("base")];

    let mut core = chunk("core");
    core.kind = Kind::Stratum;
    core.contents = vec![String::from("base"), String::from("tool")];

    let assembler = Assembler::new(settings, registry(vec![base, tool, core])).await?;
    let key = assembler.run("core").await?.expect("stratum built");
    assert!(assembler.store().get(&key).await?.is_some());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn foreign_arch_components_are_skipped() -> Result<()> {
    let root = TempDir::new()?;
    let settings = test_settings(root.path());

    let mut widget = chunk("widget");
    widget.arch = Some(String::from("m68k"));

    let assembler = Assembler::new(settings, registry(vec![widget])).await?;
    let outcome = assembler.run("widget").await?;
    assert_eq!(outcome, None, "arch mismatch contributes none");

    let key = assembler.keys().of("widget").await?;
    assert_eq!(assembler.store().get(&key).await?, None);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failing_commands_fault_and_name_the_command() -> Result<()> {
    let root = TempDir::new()?;
    let settings = test_settings(root.path());

    let mut widget = chunk("widget");
    widget.build_mode = BuildMode::Bootstrap;
    widget
        .steps
        .insert(String::from("build-commands"), vec![String::from("false")]);

    let assembler = Assembler::new(settings, registry(vec![widget])).await?;
    let err = assembler.run("widget").await.expect_err("build must fail");
    let fault = err.downcast_ref::<Fault>().expect("fault in report");
    assert!(
        matches!(fault, Fault::BuildFailed { name, command } if name == "widget" && command == "false"),
        "unexpected fault: {fault:?}",
    );

    let key = assembler.keys().of("widget").await?;
    assert_eq!(assembler.store().get(&key).await?, None, "no artifact on failure");

    let log = std::fs::read_to_string(assembler.store().log_path(&key))?;
    let last = log.lines().last().expect("log has content");
    assert!(
        last.contains("command failed") && last.contains("false"),
        "failure trailer names the command: {last}",
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn contended_claims_wait_for_the_holder_then_proceed() -> Result<()> {
    let root = TempDir::new()?;
    let settings = test_settings(root.path());

    let mut widget = chunk("widget");
    widget.build_mode = BuildMode::Bootstrap;
    widget.steps.insert(
        String::from("install-commands"),
        vec![String::from("echo built > \"$DESTDIR/hello\"")],
    );

    let assembler = Assembler::new(settings.clone(), registry(vec![widget])).await?;
    let key = assembler.keys().of("widget").await?;

    // Pose as a sibling worker holding the build claim.
    std::fs::create_dir_all(root.path().join("tmp"))?;
    let lock = Lockfile::new(settings.lockfile(&key));
    let guard = lock
        .try_exclusive()
        .await?
        .expect("test takes the claim first");
    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(700)).await;
        drop(guard);
    });

    // The scheduler observes contention, waits on the shared lock, and
    // finds the key buildable once the holder releases.
    let built = assembler.run("widget").await?.expect("built after waiting");
    assert_eq!(built, key);
    assert!(assembler.store().get(&key).await?.is_some());

    holder.await.expect("holder task");
    Ok(())
}
