use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use slotkeeper::engine::Engine;
use slotkeeper::notify::NotifyHub;
use slotkeeper::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotkeeper_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("slotkeeper.wal"), Arc::new(NotifyHub::new())).unwrap());

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(Duration::from_secs(2), self.framed.next())
            .await
            .ok()??
            .ok()?;
        serde_json::from_str(&line).ok()
    }

    /// Send a statement and return its reply, skipping notifications.
    async fn query(&mut self, sql: &str) -> Value {
        self.framed.send(sql).await.unwrap();
        loop {
            let reply = self.recv().await.expect("no reply");
            if reply["type"] != "notification" {
                return reply;
            }
        }
    }

    async fn ok(&mut self, sql: &str) -> Value {
        let reply = self.query(sql).await;
        assert_ne!(reply["type"], "error", "{sql} -> {reply}");
        reply
    }
}

/// Practitioner working Wednesdays 09:00-17:00 on a 30-minute grid.
async fn seed_practitioner(client: &mut Client) -> Ulid {
    let pid = Ulid::new();
    client
        .ok(&format!("INSERT INTO practitioners VALUES ('{pid}', 'Anna')"))
        .await;
    client
        .ok(&format!(
            "INSERT INTO working_hours VALUES ('{pid}', 3, '09:00', '17:00', 30, true)"
        ))
        .await;
    pid
}

fn slot_times(reply: &Value, available: bool) -> Vec<String> {
    reply["rows"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|r| r["available"] == available)
        .map(|r| r["time"].as_str().unwrap().to_string())
        .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn salon_day_over_tcp() {
    let (addr, _engine) = start_test_server().await;
    let mut c = Client::connect(addr).await;
    let pid = seed_practitioner(&mut c).await;

    c.ok(&format!(
        "INSERT INTO bookings VALUES ('{}', '{pid}', '2024-05-01 10:00', 60, 'Olga')",
        Ulid::new()
    ))
    .await;

    let reply = c
        .ok(&format!(
            "SELECT * FROM slots WHERE practitioner_id = '{pid}' AND day = '2024-05-01' AND duration = 60"
        ))
        .await;
    assert_eq!(reply["type"], "rows");
    assert_eq!(reply["rows"].as_array().unwrap().len(), 15);
    assert_eq!(slot_times(&reply, false), ["09:30", "10:00", "10:30"]);
    assert_eq!(reply["rows"][0], serde_json::json!({"time": "09:00", "available": true}));
}

#[tokio::test]
async fn blocked_day_has_no_slots_and_rejects_bookings() {
    let (addr, _engine) = start_test_server().await;
    let mut c = Client::connect(addr).await;
    let pid = seed_practitioner(&mut c).await;

    c.ok(&format!(
        "INSERT INTO blocked_dates VALUES ('{pid}', '2024-05-01', 'training')"
    ))
    .await;

    let reply = c
        .ok(&format!(
            "SELECT * FROM slots WHERE practitioner_id = '{pid}' AND day = '2024-05-01' AND duration = 30"
        ))
        .await;
    assert!(reply["rows"].as_array().unwrap().is_empty());

    let reply = c
        .query(&format!(
            "INSERT INTO bookings VALUES ('{}', '{pid}', '2024-05-01 09:00', 30)",
            Ulid::new()
        ))
        .await;
    assert_eq!(reply["code"], "23514");
}

#[tokio::test]
async fn block_range_reports_partial_failure() {
    let (addr, _engine) = start_test_server().await;
    let mut c = Client::connect(addr).await;
    let pid = seed_practitioner(&mut c).await;

    c.ok(&format!("INSERT INTO blocked_dates VALUES ('{pid}', '2024-08-02', NULL)"))
        .await;
    let reply = c
        .ok(&format!(
            "INSERT INTO blocked_ranges VALUES ('{pid}', '2024-08-01', '2024-08-03', 'vacation')"
        ))
        .await;
    assert_eq!(reply["rows"], 2);
    assert_eq!(reply["failed"], 1);

    let reply = c
        .ok(&format!("SELECT * FROM blocked_dates WHERE practitioner_id = '{pid}'"))
        .await;
    let days: Vec<_> = reply["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["day"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(days, ["2024-08-01", "2024-08-02", "2024-08-03"]);

    let reply = c
        .query(&format!(
            "INSERT INTO blocked_ranges VALUES ('{pid}', '2024-08-03', '2024-08-01', NULL)"
        ))
        .await;
    assert_eq!(reply["code"], "22023");
}

#[tokio::test]
async fn services_drive_duration() {
    let (addr, _engine) = start_test_server().await;
    let mut c = Client::connect(addr).await;
    let pid = seed_practitioner(&mut c).await;
    let (cut, colour) = (Ulid::new(), Ulid::new());
    c.ok(&format!("INSERT INTO services VALUES ('{cut}', 'Haircut', 120)")).await;
    c.ok(&format!("INSERT INTO services VALUES ('{colour}', 'Toning', 20)")).await;

    // 140 minutes: the last start that ends by 17:00 is 14:30.
    let reply = c
        .ok(&format!(
            "SELECT * FROM slots WHERE practitioner_id = '{pid}' AND day = '2024-05-01' AND services = '{cut},{colour}'"
        ))
        .await;
    let rows = reply["rows"].as_array().unwrap();
    assert_eq!(rows.last().unwrap()["time"], "14:30");

    let reply = c
        .query(&format!(
            "SELECT * FROM slots WHERE practitioner_id = '{pid}' AND day = '2024-05-01' AND services = '{}'",
            Ulid::new()
        ))
        .await;
    assert_eq!(reply["code"], "P0002");
}

#[tokio::test]
async fn concurrent_clients_cannot_double_book() {
    let (addr, engine) = start_test_server().await;
    let mut admin = Client::connect(addr).await;
    let pid = seed_practitioner(&mut admin).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(tokio::spawn(async move {
            let mut c = Client::connect(addr).await;
            c.query(&format!(
                "INSERT INTO bookings VALUES ('{}', '{pid}', '2024-05-01 11:00', 60)",
                Ulid::new()
            ))
            .await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        let reply = h.await.unwrap();
        match reply["type"].as_str() {
            Some("complete") => ok += 1,
            Some("error") => {
                assert_eq!(reply["code"], "23P01");
                conflicts += 1;
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(engine.get_bookings(pid, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn listen_receives_booking_notifications() {
    let (addr, _engine) = start_test_server().await;
    let mut listener = Client::connect(addr).await;
    let mut writer = Client::connect(addr).await;
    let pid = seed_practitioner(&mut writer).await;

    let reply = listener.ok(&format!("LISTEN practitioner_{pid}")).await;
    assert_eq!(reply["tag"], "LISTEN");

    let bid = Ulid::new();
    writer
        .ok(&format!(
            "INSERT INTO bookings VALUES ('{bid}', '{pid}', '2024-05-01 15:00', 30, 'Vera')"
        ))
        .await;

    let note = listener.recv().await.expect("notification");
    assert_eq!(note["type"], "notification");
    assert_eq!(note["channel"], format!("practitioner_{pid}"));
    assert!(note["payload"].as_str().unwrap().contains(&bid.to_string()));

    listener.ok("UNLISTEN *").await;
    writer.ok(&format!("DELETE FROM bookings WHERE id = '{bid}'")).await;
    assert!(listener.recv().await.is_none());
}

#[tokio::test]
async fn bookable_days_over_a_month() {
    let (addr, _engine) = start_test_server().await;
    let mut c = Client::connect(addr).await;
    let pid = seed_practitioner(&mut c).await;
    c.ok(&format!("INSERT INTO blocked_dates VALUES ('{pid}', '2024-05-15', NULL)"))
        .await;

    let reply = c
        .ok(&format!(
            "SELECT * FROM bookable_days WHERE practitioner_id = '{pid}' AND day >= '2024-05-01' AND day <= '2024-05-31' AND duration = 60"
        ))
        .await;
    let days: Vec<_> = reply["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["day"].as_str().unwrap().to_string())
        .collect();
    // Wednesdays in May 2024, minus the blocked 15th.
    assert_eq!(days, ["2024-05-01", "2024-05-08", "2024-05-22", "2024-05-29"]);
}

#[tokio::test]
async fn malformed_lines_do_not_close_the_connection() {
    let (addr, _engine) = start_test_server().await;
    let mut c = Client::connect(addr).await;

    let reply = c.query("DROP TABLE practitioners").await;
    assert_eq!(reply["code"], "42601");
    let reply = c.query("this is not sql").await;
    assert_eq!(reply["code"], "42601");

    let reply = c.ok("SELECT * FROM practitioners").await;
    assert_eq!(reply["rows"], serde_json::json!([]));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = std::env::temp_dir().join(format!("slotkeeper_int_restart_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal = dir.join("slotkeeper.wal");
    let pid = Ulid::new();
    let bid = Ulid::new();

    {
        let engine = Engine::new(wal.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine.create_practitioner(pid, Some("Anna".into())).await.unwrap();
        let window = slotkeeper::model::WorkingWindow::new(
            3,
            chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            chrono::NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            30,
            true,
        )
        .unwrap();
        engine.set_working_window(pid, window).await.unwrap();
        let start = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        engine.confirm_booking(bid, pid, start, 45, None).await.unwrap();
    }

    let engine = Engine::new(wal, Arc::new(NotifyHub::new())).unwrap();
    let bookings = engine.get_bookings(pid, None).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].id, bid);
    assert_eq!(engine.get_working_hours(pid).await.unwrap().len(), 1);
}
