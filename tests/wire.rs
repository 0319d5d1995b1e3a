use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use innkeep::engine::Engine;
use innkeep::wire;

// ── Test infrastructure ──────────────────────────────────────

const PASSWORD: &str = "innkeep";

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("innkeep_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("innkeep.wal")).unwrap());

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect_with(addr: SocketAddr, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("innkeep")
        .user("frontdesk")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_with(addr, PASSWORD).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn column(rows: &[SimpleQueryRow], name: &str) -> Vec<String> {
    rows.iter()
        .map(|r| r.get(name).unwrap_or_default().to_string())
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> &str {
    err.code().map(|c| c.code()).unwrap_or("")
}

/// 101: 1 bed at 50 + 5, 102: 2 beds at 60 + 10, 103: smoking, 201: 3 beds at 100 + 20.
async fn seed_rooms(client: &Client) {
    client
        .batch_execute(
            "INSERT INTO rooms (id, num_beds, allow_smoking, daily_rate, cleaning_fee) VALUES \
               ('101', 1, false, 50, 5), \
               ('102', 2, false, 60, 10), \
               ('103', 2, true, 40, 5), \
               ('201', 3, false, 100, 20)",
        )
        .await
        .unwrap();
}

const MARCH_WEEK: &str =
    "SELECT * FROM available_rooms WHERE start_date = '2023-03-01' AND end_date = '2023-03-05'";

// ── Availability ─────────────────────────────────────────────

#[tokio::test]
async fn available_rooms_cheapest_first() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    let found = rows(&client, MARCH_WEEK).await;
    assert_eq!(column(&found, "id"), vec!["101", "102", "201"]);
    assert_eq!(column(&found, "total_charge"), vec!["205", "250", "420"]);
    assert_eq!(column(&found, "num_beds"), vec!["1", "2", "3"]);
}

#[tokio::test]
async fn available_rooms_filters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    let big = rows(&client, &format!("{MARCH_WEEK} AND num_beds >= 2")).await;
    assert_eq!(column(&big, "id"), vec!["102", "201"]);

    let smoking = rows(&client, &format!("{MARCH_WEEK} AND allow_smoking = true")).await;
    assert_eq!(column(&smoking, "id"), vec!["103"]);
}

#[tokio::test]
async fn booked_room_drops_out_of_availability() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    client
        .batch_execute(
            "INSERT INTO reservations (room_id, checkin_date, checkout_date) \
             VALUES ('101', '2023-03-02', '2023-03-04')",
        )
        .await
        .unwrap();

    let found = rows(&client, MARCH_WEEK).await;
    assert_eq!(column(&found, "id"), vec!["102", "201"]);

    // Checkout day is free for the next guest.
    let after = rows(
        &client,
        "SELECT * FROM available_rooms WHERE start_date = '2023-03-04' AND end_date = '2023-03-06'",
    )
    .await;
    assert_eq!(column(&after, "id"), vec!["101", "102", "201"]);
}

#[tokio::test]
async fn backwards_search_window_is_rejected() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    let err = client
        .simple_query(
            "SELECT * FROM available_rooms WHERE start_date = '2023-03-05' AND end_date = '2023-03-01'",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22007");
}

// ── Reservations ─────────────────────────────────────────────

#[tokio::test]
async fn reservation_returning_quotes_charge() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    let created = rows(
        &client,
        "INSERT INTO reservations (room_id, checkin_date, checkout_date) \
         VALUES ('102', '2023-03-01', '2023-03-05') RETURNING *",
    )
    .await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get("room_id"), Some("102"));
    assert_eq!(created[0].get("checkin_date"), Some("2023-03-01"));
    assert_eq!(created[0].get("checkout_date"), Some("2023-03-05"));
    assert_eq!(created[0].get("total_charge"), Some("250"));

    let id = created[0].get("id").unwrap().to_string();
    assert!(id.parse::<Ulid>().is_ok());

    let fetched = rows(&client, &format!("SELECT * FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(column(&fetched, "room_id"), vec!["102"]);
}

#[tokio::test]
async fn overlapping_reservation_is_rejected() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    client
        .batch_execute(
            "INSERT INTO reservations (room_id, checkin_date, checkout_date) \
             VALUES ('101', '2023-03-02', '2023-03-05')",
        )
        .await
        .unwrap();

    let err = client
        .batch_execute(
            "INSERT INTO reservations (room_id, checkin_date, checkout_date) \
             VALUES ('101', '2023-03-04', '2023-03-08')",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    let message = err.as_db_error().unwrap().message().to_string();
    assert!(message.contains("101"), "{message}");

    let booked = rows(&client, "SELECT * FROM reservations WHERE room_id = '101'").await;
    assert_eq!(booked.len(), 1);
}

#[tokio::test]
async fn parameterized_reservation() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    let inserted = client
        .execute(
            "INSERT INTO reservations (room_id, checkin_date, checkout_date, total_charge) \
             VALUES ($1, $2, $3, $4)",
            &[&"201", &"2023-04-01", &"2023-04-03", &"199.99"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let booked = rows(&client, "SELECT * FROM reservations WHERE room_id = '201'").await;
    assert_eq!(column(&booked, "total_charge"), vec!["199.99"]);

    let err = client
        .execute(
            "INSERT INTO reservations (room_id, checkin_date, checkout_date) VALUES ($1, $2, $3)",
            &[&"201", &"2023-04-02", &"2023-04-04"],
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
}

#[tokio::test]
async fn parameter_values_are_not_sql() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    let err = client
        .execute(
            "INSERT INTO reservations (room_id, checkin_date, checkout_date) VALUES ($1, $2, $3)",
            &[&"101'; DROP TABLE rooms; --", &"2023-04-01", &"2023-04-03"],
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    assert_eq!(rows(&client, "SELECT * FROM rooms").await.len(), 4);
}

#[tokio::test]
async fn input_errors_map_to_sqlstates() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    let cases = [
        (
            "INSERT INTO reservations VALUES ('101', '2023-03-05', '2023-03-05')",
            "22007",
        ),
        (
            "INSERT INTO reservations VALUES ('101', '2023-03-01', '2023-03-05', -1)",
            "22023",
        ),
        ("INSERT INTO reservations VALUES ('999', '2023-03-01', '2023-03-05')", "P0002"),
        ("INSERT INTO rooms VALUES ('101', 1, false, 50, 5)", "23505"),
        ("INSERT INTO reservations VALUES ('101', 'soon', '2023-03-05')", "22P02"),
        ("SELECT * FROM guests", "42P01"),
        ("SELEKT 1", "42601"),
    ];
    for (sql, expected) in cases {
        let err = client.batch_execute(sql).await.unwrap_err();
        assert_eq!(sqlstate(&err), expected, "{sql}");
    }
}

#[tokio::test]
async fn concurrent_bookings_one_winner() {
    let (addr, engine) = start_test_server().await;
    let setup = connect(addr).await;
    seed_rooms(&setup).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = connect(addr).await;
        handles.push(tokio::spawn(async move {
            // Every window overlaps 2023-05-03.
            let checkin = format!("2023-05-0{}", 1 + i % 3);
            client
                .execute(
                    "INSERT INTO reservations (room_id, checkin_date, checkout_date) VALUES ($1, $2, $3)",
                    &[&"102", &checkin.as_str(), &"2023-05-04"],
                )
                .await
        }));
    }

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => assert_eq!(sqlstate(&e), "23P01"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(engine.reservations_for_room("102").await.unwrap().len(), 1);
}

// ── Rooms and connection ─────────────────────────────────────

#[tokio::test]
async fn room_lookup() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    seed_rooms(&client).await;

    let all = rows(&client, "SELECT * FROM rooms").await;
    assert_eq!(column(&all, "id"), vec!["101", "102", "103", "201"]);

    let one = rows(&client, "SELECT * FROM rooms WHERE id = '103'").await;
    assert_eq!(one[0].get("allow_smoking"), Some("t"));
    assert_eq!(one[0].get("daily_rate"), Some("40"));

    assert!(rows(&client, "SELECT * FROM rooms WHERE id = '999'").await.is_empty());
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _engine) = start_test_server().await;
    assert!(connect_with(addr, "letmein").await.is_err());
}

#[tokio::test]
async fn empty_query_is_accepted() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    client.batch_execute("").await.unwrap();
}
