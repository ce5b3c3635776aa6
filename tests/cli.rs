use std::path::Path;
use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use cardscan::builder::BuildLock;
use cardscan::config::ResourceDir;
use predicates::prelude::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

macro_rules! cargo_run {
    ($cmd:expr, $($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin($cmd)?;
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

#[test]
fn help_lists_subcommands() -> Result<()> {
    cargo_run!("cardscan", "--help")
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("inspect"));
    Ok(())
}

#[test]
fn inspect_empty_data_dir() -> Result<()> {
    let data_dir = assert_fs::TempDir::new()?;
    cargo_run!("cardscan", "-d", data_dir.path(), "inspect")
        .success()
        .stdout(predicate::str::contains(r#""complete": false"#))
        .stdout(predicate::str::contains(r#""last_build": null"#));
    Ok(())
}

#[test]
fn match_without_bundle_fails() -> Result<()> {
    let data_dir = assert_fs::TempDir::new()?;
    let image = data_dir.path().join("query.jpg");
    std::fs::write(&image, b"")?;
    cargo_run!("cardscan", "-d", data_dir.path(), "match", &image)
        .failure()
        .stderr(predicate::str::contains("features.bin"));
    Ok(())
}

#[test]
fn build_without_catalog_fails() -> Result<()> {
    let data_dir = assert_fs::TempDir::new()?;
    cargo_run!("cardscan", "-d", data_dir.path(), "build").failure();
    Ok(())
}

/// 只有表结构的卡牌目录
fn empty_catalog(path: &Path) -> Result<()> {
    tokio::runtime::Runtime::new()?.block_on(async {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        sqlx::query(
            r#"CREATE TABLE cards (
                id TEXT PRIMARY KEY, name TEXT NOT NULL, lang TEXT NOT NULL, layout TEXT NOT NULL,
                games TEXT NOT NULL, digital INTEGER NOT NULL, promo INTEGER, image_uris TEXT,
                "set" TEXT, set_name TEXT, collector_number TEXT, prices TEXT
            )"#,
        )
        .execute(&pool)
        .await?;
        pool.close().await;
        Ok::<_, anyhow::Error>(())
    })
}

#[test]
fn build_fails_while_another_process_builds() -> Result<()> {
    let data_dir = assert_fs::TempDir::new()?;
    let dir = ResourceDir::new(data_dir.path());
    empty_catalog(&dir.catalog())?;

    let lock = BuildLock::acquire(&dir)?;
    cargo_run!("cardscan", "-d", data_dir.path(), "build")
        .failure()
        .stderr(predicate::str::contains("已有构建任务正在运行"));
    drop(lock);

    // 锁释放后可以正常开始构建，空目录因描述符不足而失败
    cargo_run!("cardscan", "-d", data_dir.path(), "build")
        .failure()
        .stderr(predicate::str::contains("已有构建任务正在运行").not());
    Ok(())
}
