use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use appointd::engine::Engine;
use appointd::model::{DayHours, Event};
use appointd::notify::NotifyHub;
use appointd::wire::{self, BookingServerFactory, FacilityDefaults};

// ── Test infrastructure ──────────────────────────────────────

const PASSWORD: &str = "appointd";
const DAY: &str = "2030-03-04";

async fn start_test_server(auto_confirm: bool) -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("appointd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("appointd.wal"), Arc::new(NotifyHub::new())).unwrap());

    let defaults = FacilityDefaults {
        slot_minutes: 30,
        auto_confirm,
        hours: DayHours::new(9 * 60, 17 * 60),
    };
    let factory = Arc::new(BookingServerFactory::new(engine.clone(), defaults, PASSWORD.to_string()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("appointd")
        .user("appointd")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

struct Salon {
    facility: Ulid,
    service: Ulid,
}

async fn setup_salon(client: &tokio_postgres::Client) -> Salon {
    let facility = Ulid::new();
    let service = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO facilities (id, name) VALUES ('{facility}', 'Corner Salon')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, facility_id, name, duration, price) \
             VALUES ('{service}', '{facility}', 'Trim', 30, 2500)"
        ))
        .await
        .unwrap();
    Salon { facility, service }
}

fn book_sql(salon: &Salon, email: &str, start: &str) -> String {
    format!(
        "INSERT INTO bookings (facility_id, customer_name, customer_email, service_id, start) \
         VALUES ('{}', 'Ada', '{email}', '{}', '{DAY} {start}')",
        salon.facility, salon.service
    )
}

fn slots_sql(salon: &Salon) -> String {
    format!(
        r#"SELECT * FROM slots WHERE facility_id = '{}' AND service_id = '{}' AND "date" = '{DAY}'"#,
        salon.facility, salon.service
    )
}

async fn slot_available(client: &tokio_postgres::Client, salon: &Salon, time: &str) -> bool {
    let slots = rows(client.simple_query(&slots_sql(salon)).await.unwrap());
    let slot = slots
        .iter()
        .find(|r| r.get("time") == Some(time))
        .unwrap_or_else(|| panic!("no slot at {time}"));
    slot.get("available") == Some("t")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn facilities_and_services_round_trip() {
    let (addr, _engine) = start_test_server(true).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    let facilities = rows(client.simple_query("SELECT * FROM facilities").await.unwrap());
    assert_eq!(facilities.len(), 1);
    assert_eq!(facilities[0].get("id"), Some(salon.facility.to_string().as_str()));
    assert_eq!(facilities[0].get("name"), Some("Corner Salon"));
    assert_eq!(facilities[0].get("slot_minutes"), Some("30"));

    let services = rows(
        client
            .simple_query(&format!("SELECT * FROM services WHERE facility_id = '{}'", salon.facility))
            .await
            .unwrap(),
    );
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].get("name"), Some("Trim"));
    assert_eq!(services[0].get("duration"), Some("30"));
    assert_eq!(services[0].get("price"), Some("2500"));
}

#[tokio::test]
async fn slots_follow_opening_hours() {
    let (addr, _engine) = start_test_server(true).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    let slots = rows(client.simple_query(&slots_sql(&salon)).await.unwrap());
    assert_eq!(slots.len(), 16);
    assert_eq!(slots[0].get("time"), Some("09:00"));
    assert_eq!(slots[15].get("time"), Some("16:30"));
    assert!(slots.iter().all(|r| r.get("available") == Some("t")));

    // Monday closed.
    client
        .batch_execute(&format!(
            "INSERT INTO hours (facility_id, weekday, open, close) VALUES ('{}', 'mon', NULL, NULL)",
            salon.facility
        ))
        .await
        .unwrap();
    let slots = rows(client.simple_query(&slots_sql(&salon)).await.unwrap());
    assert!(slots.is_empty());
}

#[tokio::test]
async fn booking_occupies_slot() {
    let (addr, _engine) = start_test_server(true).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    let booked = rows(assert_ok!(client.simple_query(&book_sql(&salon, "ada@example.com", "10:00")).await));
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("start"), Some("2030-03-04 10:00"));
    assert_eq!(booked[0].get("end"), Some("2030-03-04 10:30"));
    assert_eq!(booked[0].get("status"), Some("confirmed"));

    assert!(!slot_available(&client, &salon, "10:00").await);
    assert!(slot_available(&client, &salon, "10:30").await);
    assert!(slot_available(&client, &salon, "09:30").await);
}

#[tokio::test]
async fn double_booking_reports_exclusion_violation() {
    let (addr, _engine) = start_test_server(true).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    assert_ok!(client.simple_query(&book_sql(&salon, "ada@example.com", "11:00")).await);

    let other = connect(addr).await;
    let err = assert_err!(other.simple_query(&book_sql(&salon, "grace@example.com", "11:00")).await);
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    let listed = rows(
        client
            .simple_query(&format!(
                r#"SELECT * FROM bookings WHERE facility_id = '{}' AND "date" = '{DAY}'"#,
                salon.facility
            ))
            .await
            .unwrap(),
    );
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn status_transitions_over_the_wire() {
    let (addr, _engine) = start_test_server(false).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    let booked = rows(client.simple_query(&book_sql(&salon, "ada@example.com", "13:00")).await.unwrap());
    assert_eq!(booked[0].get("status"), Some("pending"));
    let id = booked[0].get("id").unwrap().to_string();

    let set_status = |status: &str| format!("INSERT INTO booking_status (booking_id, status) VALUES ('{id}', '{status}')");

    let err = assert_err!(client.simple_query(&set_status("completed")).await);
    assert_eq!(err.code(), Some(&SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE));

    let confirmed = rows(assert_ok!(client.simple_query(&set_status("confirmed")).await));
    assert_eq!(confirmed[0].get("status"), Some("confirmed"));

    let completed = rows(assert_ok!(client.simple_query(&set_status("completed")).await));
    assert_eq!(completed[0].get("status"), Some("completed"));

    let err = assert_err!(client.simple_query(&set_status("cancelled")).await);
    assert_eq!(err.code(), Some(&SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE));
}

#[tokio::test]
async fn delete_cancels_and_frees_slot() {
    let (addr, _engine) = start_test_server(true).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    let booked = rows(client.simple_query(&book_sql(&salon, "ada@example.com", "14:00")).await.unwrap());
    let id = booked[0].get("id").unwrap().to_string();
    assert!(!slot_available(&client, &salon, "14:00").await);

    assert_ok!(client.batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'")).await);
    assert!(slot_available(&client, &salon, "14:00").await);

    assert_ok!(client.simple_query(&book_sql(&salon, "grace@example.com", "14:00")).await);
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _engine) = start_test_server(true).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    let err = assert_err!(client.simple_query("SELEC * FROM slots").await);
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    let err = assert_err!(client.simple_query("SELECT * FROM rooms").await);
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    let err = assert_err!(
        client
            .simple_query(&format!("INSERT INTO facilities (id) VALUES ('{}')", salon.facility))
            .await
    );
    assert_eq!(err.code(), Some(&SqlState::DUPLICATE_OBJECT));

    let err = assert_err!(client.simple_query(&book_sql(&salon, "not-an-email", "15:00")).await);
    assert_eq!(err.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let err = assert_err!(
        client
            .simple_query(&format!("DELETE FROM bookings WHERE id = '{}'", Ulid::new()))
            .await
    );
    assert_eq!(err.code(), Some(&SqlState::UNDEFINED_OBJECT));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _engine) = start_test_server(true).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    let facility = salon.facility.to_string();
    let service = salon.service.to_string();
    let inserted = assert_ok!(
        client
            .execute(
                "INSERT INTO bookings (facility_id, customer_name, customer_email, service_id, start) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[&facility, &"O'Brien", &"obrien@example.com", &service, &"2030-03-04 09:00"],
            )
            .await
    );
    assert_eq!(inserted, 1);

    let slots = assert_ok!(
        client
            .query(
                r#"SELECT * FROM slots WHERE facility_id = $1 AND service_id = $2 AND "date" = $3"#,
                &[&facility, &service, &DAY],
            )
            .await
    );
    assert_eq!(slots.len(), 16);
    let first: String = slots[0].get("time");
    assert_eq!(first, "09:00");
}

#[tokio::test]
async fn bound_notes_keep_placeholder_text() {
    let (addr, _engine) = start_test_server(true).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    let facility = salon.facility.to_string();
    let service = salon.service.to_string();
    assert_ok!(
        client
            .execute(
                "INSERT INTO bookings (facility_id, customer_name, customer_email, service_id, start, notes) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[&facility, &"Ada", &"ada@example.com", &service, &"2030-03-04 12:00", &"bring $1 cash"],
            )
            .await
    );

    let listed = rows(
        client
            .simple_query(&format!("SELECT * FROM bookings WHERE facility_id = '{facility}'"))
            .await
            .unwrap(),
    );
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("notes"), Some("bring $1 cash"));
}

#[tokio::test]
async fn wire_writes_reach_subscribers() {
    let (addr, engine) = start_test_server(true).await;
    let client = connect(addr).await;
    let salon = setup_salon(&client).await;

    let mut rx = engine.subscribe(salon.facility);
    client
        .simple_query(&book_sql(&salon, "ada@example.com", "16:00"))
        .await
        .unwrap();

    // Customer registration precedes the booking on the same channel.
    let mut saw_booking = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        if let Event::BookingAdmitted { booking } = event {
            assert_eq!(booking.facility_id, salon.facility);
            saw_booking = true;
            break;
        }
    }
    assert!(saw_booking, "expected a BookingAdmitted event");
}
