mod common;

use common::{config, eventually, init_tracing, FakeCube, Recorder, HELLO};
use cubelink::{
    BackupJournal, ChannelCommand, Command, ConnectionState, CubeCommand, DeviceStatusListener,
    GatewayClient, GatewayConfig, HubInfo, ListenerError, ListenerResult, TextCodec, ThermostatMode,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

fn client(cube: &Arc<FakeCube>, config: GatewayConfig) -> GatewayClient {
    GatewayClient::with_connector(config, cube.clone(), Box::new(TextCodec::new())).unwrap()
}

fn listen(client: &GatewayClient) -> Arc<Recorder> {
    let recorder = Arc::new(Recorder::default());
    assert!(client.register_listener(recorder.clone()));
    recorder
}

async fn drain(client: &GatewayClient) {
    while client.queue_len() > 0 {
        client.flush_once().await;
    }
}

#[tokio::test]
async fn refresh_discovers_devices_then_reports_changes() {
    init_tracing();
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    let recorder = listen(&client);

    assert!(client.refresh().await);
    assert_eq!(
        recorder.events(),
        vec!["discovered:KEQ1", "changed:KEQ1", "discovered:KEQ2", "changed:KEQ2"]
    );
    let thermostat = client.device("KEQ1").unwrap();
    assert_eq!(thermostat.room_name(), "Living");
    assert_eq!(thermostat.mode(), Some(ThermostatMode::Automatic));
    assert_eq!(client.rooms().len(), 1);
    assert_eq!(client.cube_info().serial, "KEQ0523864");

    recorder.clear();
    assert!(client.refresh().await);
    assert_eq!(recorder.events(), vec!["changed:KEQ1", "changed:KEQ2"]);
    // The first list came with the handshake, the second one was requested.
    assert_eq!(cube.received_with_prefix("l:"), vec!["l:"]);
}

#[tokio::test]
async fn newly_seen_devices_are_reported_fully_updated() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));

    struct UpdatedCheck(std::sync::Mutex<Vec<bool>>);
    impl DeviceStatusListener for UpdatedCheck {
        fn on_device_changed(&self, _hub_id: &str, device: &cubelink::Device) -> cubelink::ListenerResult {
            let all = device.attributes().values().all(|a| a.updated);
            self.0.lock().unwrap().push(all);
            Ok(())
        }
    }
    let check = Arc::new(UpdatedCheck(std::sync::Mutex::new(Vec::new())));
    client.register_listener(check.clone());
    assert!(client.refresh().await);
    assert_eq!(*check.0.lock().unwrap(), vec![true, true]);
}

#[tokio::test]
async fn superseded_set_temperature_is_sent_once() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    assert!(client.refresh().await);

    client.queue_command("KEQ1", ChannelCommand::SetTemperature(21.0), "slider");
    client.queue_command("KEQ1", ChannelCommand::SetTemperature(21.5), "slider");
    drain(&client).await;

    assert_eq!(cube.received_with_prefix("s:"), vec!["s:0a1b2c,1,AUTOMATIC,21.5"]);
    assert_eq!(client.cube_info().duty_cycle, 3);
}

#[tokio::test]
async fn mode_change_is_recorded_after_delivery() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    assert!(client.refresh().await);

    client.queue_command("KEQ1", ChannelCommand::SetMode(ThermostatMode::Boost), "mode");
    drain(&client).await;

    assert_eq!(cube.received_with_prefix("s:"), vec!["s:0a1b2c,1,BOOST,20.0"]);
    assert_eq!(client.device("KEQ1").unwrap().mode(), Some(ThermostatMode::Boost));
}

#[tokio::test]
async fn channel_command_for_unknown_device_is_dropped() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    client.queue_command("NOPE", ChannelCommand::SetTemperatureOff, "off");
    assert!(!client.flush_once().await);
    assert_eq!(client.queue_len(), 0);
    assert_eq!(cube.connects.load(Ordering::SeqCst), 0);
    assert!(client.is_online());
}

#[tokio::test]
async fn io_failure_reports_connection_lost_once_and_resyncs() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    let recorder = listen(&client);
    assert!(client.refresh().await);
    assert_eq!(recorder.count("discovered"), 2);

    cube.hang_up_on_command.store(true, Ordering::SeqCst);
    assert!(!client.refresh().await);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(!client.is_online());

    cube.hang_up_on_command.store(false, Ordering::SeqCst);
    cube.refuse.store(true, Ordering::SeqCst);
    assert!(!client.refresh().await);
    assert_eq!(recorder.count("lost"), 1);

    cube.refuse.store(false, Ordering::SeqCst);
    recorder.clear();
    assert!(client.refresh().await);
    assert_eq!(client.request_count(), 1);
    assert_eq!(
        recorder.events(),
        vec!["connection", "discovered:KEQ1", "changed:KEQ1", "discovered:KEQ2", "changed:KEQ2"]
    );
}

#[tokio::test]
async fn first_refresh_failure_reports_connection_lost() {
    let cube = FakeCube::new();
    cube.refuse.store(true, Ordering::SeqCst);
    let client = client(&cube, config(true));
    let recorder = listen(&client);
    assert!(!client.refresh().await);
    assert!(!client.refresh().await);
    assert_eq!(recorder.events(), vec!["lost"]);
}

#[tokio::test]
async fn queue_rejects_commands_beyond_capacity() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    for i in 0..50 {
        assert!(client.queue(Command::new(format!("DEV{}", i), ChannelCommand::SetTemperatureOn, "on")));
    }
    assert!(!client.queue(Command::new("DEV50", ChannelCommand::SetTemperatureOn, "on")));
    assert_eq!(client.queue_len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refresh_and_flush_never_interleave() {
    for exclusive in [true, false] {
        let cube = FakeCube::new();
        let client = client(&cube, config(exclusive));
        assert!(client.refresh().await);
        for i in 0..20 {
            client.queue_command("KEQ1", ChannelCommand::SetTemperature(18.0 + i as f64 * 0.5), format!("step {}", i));
            client.queue_command("cube", CubeCommand::Ntp { servers: vec![] }, "ntp");
        }

        let refresher = {
            let client = client.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    assert!(client.refresh().await);
                }
            })
        };
        let flusher = {
            let client = client.clone();
            tokio::spawn(async move {
                while client.queue_len() > 0 {
                    assert!(client.flush_once().await);
                }
            })
        };
        refresher.await.unwrap();
        flusher.await.unwrap();

        assert_eq!(cube.max_open.load(Ordering::SeqCst), 1);
        let writes = cube.writes.lock().unwrap().clone();
        assert!(!writes.is_empty());
        for write in writes {
            let text = String::from_utf8(write).unwrap();
            assert!(text.ends_with("\r\n"), "partial write {:?}", text);
            assert_eq!(text.matches("\r\n").count(), 1, "merged writes {:?}", text);
        }
        for line in cube.received() {
            let tag = line.get(..2).unwrap();
            assert!(["l:", "s:", "f:"].contains(&tag), "unexpected line {:?}", line);
        }
    }
}

#[tokio::test]
async fn request_count_stays_within_limit() {
    let cube = FakeCube::new();
    let config = GatewayConfig::builder()
        .host("fake-cube")
        .exclusive(true)
        .max_requests_per_connection(3)
        .build()
        .unwrap();
    let client = client(&cube, config);
    for _ in 0..10 {
        assert!(client.refresh().await);
        let count = client.request_count();
        assert!((1..=3).contains(&count), "request count {}", count);
    }
    assert_eq!(cube.connects.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn failing_listener_is_dropped_and_devices_are_rediscovered() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    let good = listen(&client);
    let bad = Arc::new(Recorder::default());
    bad.fail_changes.store(true, Ordering::SeqCst);
    client.register_listener(bad.clone());

    assert!(client.refresh().await);
    assert_eq!(bad.count("discovered"), 2);

    // Dropping the failing listener forgets what was reported, so the
    // device after the failure is announced as new again.
    good.clear();
    assert!(client.refresh().await);
    assert_eq!(good.events(), vec!["changed:KEQ1", "discovered:KEQ2", "changed:KEQ2"]);
    let bad_listener: Arc<dyn DeviceStatusListener> = bad;
    assert!(!client.unregister_listener(&bad_listener));
}

#[tokio::test]
async fn listener_dropped_during_dispatch_forgets_reported_devices() {
    struct RejectsConfig;
    impl DeviceStatusListener for RejectsConfig {
        fn on_device_config_updated(&self, _hub: &HubInfo, _device: &cubelink::Device) -> ListenerResult {
            Err(ListenerError("read-only".into()))
        }
    }

    let cube = FakeCube::new();
    let config = GatewayConfig::builder()
        .host("fake-cube")
        .exclusive(true)
        .max_requests_per_connection(1)
        .build()
        .unwrap();
    let client = client(&cube, config);
    let good = listen(&client);
    let bad: Arc<dyn DeviceStatusListener> = Arc::new(RejectsConfig);
    assert!(client.register_listener(Arc::clone(&bad)));

    assert!(client.refresh().await);
    assert_eq!(good.count("discovered"), 2);

    // The reconnect replays the configuration of KEQ1 to a listener that
    // refuses it.
    good.clear();
    assert!(client.refresh().await);
    assert!(!client.unregister_listener(&bad));
    assert_eq!(
        good.events(),
        vec!["config:KEQ1", "discovered:KEQ1", "changed:KEQ1", "discovered:KEQ2", "changed:KEQ2"]
    );
}

#[tokio::test]
async fn unreadable_lines_do_not_break_the_exchange() {
    let mut dump = vec![
        HELLO.to_string(),
        "M:00,02,room_id=9,room_name=Attic".to_string(),
        "garbage".to_string(),
        "M:01,02,serial=KEQ9,rf=090909,type=thermostat,name=Ghost,room=9".to_string(),
        "Z:x=1".to_string(),
    ];
    dump.extend(common::default_dump().into_iter().skip(1));
    let cube = FakeCube::with_dump(dump);
    let client = client(&cube, config(true));

    assert!(client.refresh().await);
    assert_eq!(client.devices().len(), 2);
    assert!(client.device("KEQ9").is_none());
    let rooms: Vec<String> = client.rooms().into_iter().map(|r| r.name).collect();
    assert_eq!(rooms, vec!["Living"]);
    assert_eq!(client.device("KEQ1").unwrap().mode(), Some(ThermostatMode::Automatic));

    assert!(client.refresh().await);
    assert_eq!(client.request_count(), 2);
}

#[tokio::test]
async fn delete_device_queues_delete_and_reload() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    let recorder = listen(&client);
    assert!(client.refresh().await);

    assert!(client.delete_device("keq2"));
    assert!(!client.delete_device("KEQ404"));
    assert!(client.device("KEQ2").is_none());
    assert_eq!(recorder.count("removed"), 1);

    drain(&client).await;
    assert_eq!(cube.received_with_prefix("t:"), vec!["t:0d0e0f,1"]);
    assert_eq!(cube.received_with_prefix("q:"), vec!["q:"]);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reset_config_reports_all_devices_removed() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    let recorder = listen(&client);
    assert!(client.refresh().await);
    client.reset_config();
    assert!(client.devices().is_empty());
    assert_eq!(recorder.count("removed"), 2);
    drain(&client).await;
    assert_eq!(cube.received_with_prefix("a:"), vec!["a:"]);
}

#[tokio::test]
async fn inclusion_queues_configuration_request_for_new_device() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    assert!(client.start_inclusion().await);
    assert_eq!(client.queue_len(), 2);
    drain(&client).await;
    assert_eq!(cube.received(), vec!["n:", "f:", "c:0c0c0c"]);
    assert_eq!(
        client.cube_info().ntp_servers,
        vec!["ntp.homematic.com".to_string(), "pool.ntp.org".to_string()]
    );
}

#[tokio::test]
async fn ntp_update_is_sent_with_server_list() {
    let cube = FakeCube::new();
    let client = client(&cube, config(false));
    client.update_ntp_servers(vec!["a.example".into(), "b.example".into()]);
    drain(&client).await;
    // The hello of the first connection queued the NTP query behind it.
    assert_eq!(cube.received_with_prefix("f:"), vec!["f:a.example,b.example", "f:"]);
}

#[tokio::test]
async fn excess_duty_cycle_holds_commands() {
    let mut dump = common::default_dump();
    dump[0] = HELLO.replace("duty=0", "duty=85");
    let cube = FakeCube::with_dump(dump);
    let client = client(&cube, config(true));
    assert!(client.refresh().await);
    assert!(client.cube_info().has_excess_duty_cycle());

    let queued = client.queue_len();
    assert!(!client.flush_once().await);
    assert_eq!(client.queue_len(), queued);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn backup_journals_the_state_dump() {
    let dir = tempfile::tempdir().unwrap();
    let cube = FakeCube::new();
    let config = GatewayConfig::builder()
        .host("fake-cube")
        .exclusive(true)
        .backup_directory(dir.path())
        .build()
        .unwrap();
    let client = client(&cube, config);
    client.backup().await.unwrap();
    assert!(client.refresh().await);
    client.flush_backups().await.unwrap();

    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("KEQ0523864-") && name.ends_with(".jsonl"), "{}", name);
    let lines = BackupJournal::load_lines(&files[0]).await.unwrap();
    assert_eq!(lines, common::default_dump());
}

#[tokio::test]
async fn backup_without_directory_is_rejected() {
    let cube = FakeCube::new();
    let client = client(&cube, config(true));
    assert!(client.backup().await.is_err());
}

#[tokio::test]
async fn periodic_tasks_refresh_and_flush() {
    let cube = FakeCube::new();
    let config = GatewayConfig::builder()
        .host("fake-cube")
        .exclusive(true)
        .flush_interval_ms(20)
        .build()
        .unwrap();
    let client = client(&cube, config);
    let recorder = listen(&client);
    assert!(client.start().await);
    assert!(!client.start().await);

    assert!(eventually(|| recorder.count("discovered") == 2).await);
    client.queue_command("KEQ1", ChannelCommand::SetTemperatureOff, "off");
    assert!(eventually(|| cube.received_with_prefix("s:").len() == 1).await);
    assert_eq!(cube.received_with_prefix("s:"), vec!["s:0a1b2c,1,AUTOMATIC,4.5"]);

    client.stop().await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(client.start().await);
    client.stop().await;
}

#[tokio::test]
async fn talks_to_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        for line in common::default_dump() {
            wr.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        }
        let mut lines = BufReader::new(rd).lines();
        let mut received = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            received.push(line);
        }
        received
    });

    let config = GatewayConfig::builder()
        .host("127.0.0.1")
        .port(port)
        .io_timeout_ms(2000)
        .build()
        .unwrap();
    let client = GatewayClient::new(config).unwrap();
    assert!(client.refresh().await);
    assert_eq!(client.devices().len(), 2);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(server.await.unwrap().is_empty());
}
