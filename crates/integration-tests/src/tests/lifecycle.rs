//! Integration tests for the instance lifecycle: create, clone, info, rm

use color_eyre::eyre::eyre;
use color_eyre::Result;
use linkme::distributed_slice;

use crate::{get_test_template, integration_test, run_virtforge, unique_name, DomainCleanup};

fn list_entry(name: &str) -> Result<Option<serde_json::Value>> {
    let out = run_virtforge(&["list", "--format", "json"])?;
    out.assert_success("list");
    let list = out.json()?;
    Ok(list
        .as_array()
        .ok_or_else(|| eyre!("Expected a JSON array: {}", out.stdout))?
        .iter()
        .find(|d| d["name"] == name)
        .cloned())
}

fn test_create_info_and_remove() -> Result<()> {
    let Some(template) = get_test_template() else {
        println!("VIRTFORGE_TEST_TEMPLATE not set, skipping");
        return Ok(());
    };
    let name = unique_name("vm");
    let cleanup = DomainCleanup(name.clone());

    let out = run_virtforge(&[
        "create", &template, &name, "--ram", "1.5", "--vcpus", "2", "--disk-size", "12",
        "--format", "json",
    ])?;
    out.assert_success("create");
    let created = out.json()?;
    assert_eq!(created["name"], name.as_str());
    assert_eq!(created["volumes"].as_array().map(|v| v.len()), Some(2));

    let out = run_virtforge(&["info", &name, "--format", "json"])?;
    out.assert_success("info");
    let info = out.json()?;
    assert_eq!(info["vcpus"], 2);
    assert_eq!(info["state"], "shut-off");
    let disks = info["disks"]
        .as_array()
        .ok_or_else(|| eyre!("Missing disks: {}", out.stdout))?;
    assert_eq!(disks.len(), 2);
    assert!(info["interfaces"]
        .as_array()
        .is_some_and(|i| i.iter().all(|i| i["mac"].is_string())));
    assert!(list_entry(&name)?.is_some());

    // The name is now taken.
    let out = run_virtforge(&["create", &template, &name])?;
    assert!(!out.success());

    let out = run_virtforge(&["rm", "--force", &name])?;
    out.assert_success("rm");
    assert!(list_entry(&name)?.is_none());
    drop(cleanup);
    Ok(())
}
integration_test!(test_create_info_and_remove);

fn test_clone_stopped_instance() -> Result<()> {
    let Some(template) = get_test_template() else {
        println!("VIRTFORGE_TEST_TEMPLATE not set, skipping");
        return Ok(());
    };
    let source = unique_name("src");
    let _source_cleanup = DomainCleanup(source.clone());
    run_virtforge(&["create", &template, &source])?.assert_success("create source");

    let copy = unique_name("copy");
    let _copy_cleanup = DomainCleanup(copy.clone());
    let out = run_virtforge(&["clone", &source, &copy, "--format", "json"])?;
    out.assert_success("clone");
    assert_eq!(out.json()?["volumes"].as_array().map(|v| v.len()), Some(1));

    // The source disk backs the clone and cannot go first.
    let out = run_virtforge(&["rm", "--force", &source])?;
    assert!(!out.success());
    assert!(out.stderr.contains("delete-disks"), "{}", out.stderr);

    run_virtforge(&["rm", "--force", &copy])?.assert_success("rm clone");
    Ok(())
}
integration_test!(test_clone_stopped_instance);

fn test_disk_hotplug() -> Result<()> {
    let Some(template) = get_test_template() else {
        println!("VIRTFORGE_TEST_TEMPLATE not set, skipping");
        return Ok(());
    };
    let name = unique_name("disk");
    let _cleanup = DomainCleanup(name.clone());
    run_virtforge(&["create", &template, &name])?.assert_success("create");

    let out = run_virtforge(&["disk", "add", &name, "--size", "1"])?;
    out.assert_success("disk add");
    let volume = format!("{name}_3.img");
    assert!(out.stdout.contains(&volume), "{}", out.stdout);

    run_virtforge(&["disk", "rm", &name, &volume])?.assert_success("disk rm");
    let out = run_virtforge(&["disk", "rm", &name, &volume])?;
    assert!(!out.success());
    Ok(())
}
integration_test!(test_disk_hotplug);
