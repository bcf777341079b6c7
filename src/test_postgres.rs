#![allow(dead_code)]

//! PostgreSQL test infrastructure.
//!
//! One container is started for the whole test run; each test gets its own database in it.

use std::sync::OnceLock;

use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::runtime::Runtime;
use uuid::Uuid;

/// Default credentials for testcontainers-modules postgres
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

struct SharedContainer {
    // keeps the container's background tasks alive
    _runtime: Runtime,
    port: u16,
}

static POSTGRES: OnceLock<SharedContainer> = OnceLock::new();

fn postgres_port() -> u16 {
    POSTGRES
        .get_or_init(|| {
            let runtime = Runtime::new().expect("failed to create tokio runtime");
            let port = runtime.block_on(async {
                let container = Postgres::default()
                    .start()
                    .await
                    .expect("failed to start postgres container");
                let port = container
                    .get_host_port_ipv4(5432)
                    .await
                    .expect("failed to get postgres port");
                // outlive the test run; the container is reaped with the process
                std::mem::forget(container);
                port
            });
            SharedContainer {
                _runtime: runtime,
                port,
            }
        })
        .port
}

/// Connection URL for a database in the shared container.
pub fn url_with_db(db: &str) -> String {
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        postgres_port(),
        db
    )
}

/// Create a database with a unique name and connect to it.
pub fn fresh_postgres_db() -> (Client, String) {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");
    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .execute(&format!("CREATE DATABASE \"{}\"", db_name), &[])
        .expect("failed to create test database");
    drop(admin);

    let client =
        Client::connect(&url_with_db(&db_name), NoTls).expect("failed to connect to test database");
    (client, db_name)
}

/// A client connected to a fresh, isolated database.
pub fn get_test_client() -> Client {
    let (client, _db_name) = fresh_postgres_db();
    client
}
