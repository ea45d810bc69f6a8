//! End-to-end exercise of the scheduler against a real loopback TCP pair
//! (§8), driven entirely through `DaemonHandle` the way a façade would.

use std::time::Duration;

use flowgrind::daemon::DaemonHandle;
use flowgrind::flow::{Direction, FlowSettings, SourceSettings};
use flowgrind::stats::ReportKind;
use flowgrind::time::Timestamp;

fn settings(write_duration: f64, read_duration: f64) -> FlowSettings {
    let mut s = FlowSettings::default();
    s.bind_address = "127.0.0.1".to_string();
    s.maximum_block_size = 256;
    s.reporting_interval = 0.0;
    s.duration[Direction::Write as usize] = write_duration;
    s.duration[Direction::Read as usize] = read_duration;
    s
}

#[test]
fn bulk_transfer_moves_bytes_between_a_source_and_a_destination() {
    let daemon = DaemonHandle::spawn().expect("scheduler thread spawns");

    let dest_reply = daemon
        .add_destination(settings(0.0, 10.0))
        .expect("destination admission succeeds");

    let source_reply = daemon
        .add_source(
            settings(10.0, 10.0),
            SourceSettings {
                destination_host: "127.0.0.1".to_string(),
                destination_port: dest_reply.listen_port,
                late_connect: false,
            },
        )
        .expect("source admission succeeds");

    daemon.start_flows(Timestamp::now()).expect("start_flows succeeds");

    std::thread::sleep(Duration::from_millis(500));

    daemon.stop_flow(None).expect("stop_flow succeeds");

    let (reports, _more) = daemon.get_reports();
    let final_reports: Vec<_> = reports.iter().filter(|r| r.kind == ReportKind::Final).collect();

    let source_final = final_reports
        .iter()
        .find(|r| r.flow_id == source_reply.flow_id)
        .expect("source flow produced a final report");
    let dest_final = final_reports
        .iter()
        .find(|r| r.flow_id == dest_reply.flow_id)
        .expect("destination flow produced a final report");

    assert!(source_final.bytes_written > 0, "source should have written bytes over 500ms");
    assert!(dest_final.bytes_read > 0, "destination should have read the bytes the source wrote");
    assert_eq!(dest_final.bytes_read, source_final.bytes_written);
}

#[test]
fn late_connect_source_defers_connection_until_scheduled_write() {
    let daemon = DaemonHandle::spawn().expect("scheduler thread spawns");

    let dest_reply = daemon.add_destination(settings(0.0, 10.0)).expect("destination admission succeeds");

    let mut source_settings = settings(10.0, 10.0);
    source_settings.duration[Direction::Write as usize] = 10.0;

    let source_reply = daemon
        .add_source(
            source_settings,
            SourceSettings {
                destination_host: "127.0.0.1".to_string(),
                destination_port: dest_reply.listen_port,
                late_connect: true,
            },
        )
        .expect("late-connect source admission succeeds");

    daemon.start_flows(Timestamp::now()).expect("start_flows succeeds");
    std::thread::sleep(Duration::from_millis(300));
    daemon.stop_flow(Some(source_reply.flow_id)).expect("stop source flow");
    daemon.stop_flow(Some(dest_reply.flow_id)).expect("stop destination flow");

    let (reports, _more) = daemon.get_reports();
    let source_final = reports
        .iter()
        .find(|r| r.flow_id == source_reply.flow_id && r.kind == ReportKind::Final)
        .expect("late-connect source still produced a final report");
    assert!(source_final.bytes_written > 0, "late connect should still transfer once its write schedule starts");
}
