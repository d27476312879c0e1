use log::info;
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use std::io;
use std::path::Path;
use tokio::fs::{create_dir_all, File};

pub mod entities;
pub mod migration;

/// Connects to the SQLite-backed store at `database_file`, creating the
/// parent directory and file if needed, then runs the schema migration.
pub async fn connect(database_file: &str) -> io::Result<DatabaseConnection> {
    info!("Connecting to store..");

    let file_path = Path::new(database_file);
    if let Some(parent) = file_path.parent() {
        if !parent.exists() {
            create_dir_all(parent).await?;
        }
    }

    if !file_path.exists() {
        File::create(file_path).await?;
    }

    let con_str = format!("sqlite:{database_file}");
    let connection = sea_orm::Database::connect(&con_str).await.map_err(|err| {
        io::Error::new(io::ErrorKind::Other, format!("unable to connect to store: {err:?}"))
    })?;

    info!("Connected to store: {con_str}");
    info!("Running schema bring-up...");

    Migrator::up(&connection, None)
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("unable to bring up schema: {err:?}")))?;

    info!("Schema bring-up complete.");

    Ok(connection)
}
