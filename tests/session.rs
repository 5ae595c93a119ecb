//! Setup and teardown of a run against a fake tracefs tree.

mod common;

use common::FakeTracefs;
use opensnoop::{Config, Session, SnoopError};

const INSTALL_LINE: &str = "r:kprobes/getnameprobe getname +0(+0($retval)):string\n";
const REMOVE_LINE: &str = "-:kprobes/getnameprobe\n";

#[test]
fn test_setup_enables_only_the_probe() {
    let fake = FakeTracefs::new(2);
    let mut session = Session::setup(fake.tracefs(), fake.config()).unwrap();

    assert_eq!(fake.dynamic_events_log(), INSTALL_LINE);
    let enabled = session.instance().unwrap().enabled_events().unwrap();
    assert_eq!(
        enabled,
        vec![("kprobes".to_string(), "getnameprobe".to_string())]
    );
    assert_eq!(
        fake.read_instance_file("events/sched/sched_switch/enable"),
        "0"
    );

    fake.release_instance("opensnoop");
    session.teardown().unwrap();
    assert_eq!(
        fake.dynamic_events_log(),
        format!("{INSTALL_LINE}{REMOVE_LINE}")
    );
    assert!(!fake.instance_dir("opensnoop").exists());
}

#[test]
fn test_bad_probe_name_touches_nothing() {
    let fake = FakeTracefs::bare(1);
    let config = Config {
        probe_event: "getname-probe".to_string(),
        ..fake.config()
    };

    let err = Session::setup(fake.tracefs(), config).err().unwrap();
    assert!(matches!(err, SnoopError::Allocation { .. }), "{err}");
    assert_eq!(fake.dynamic_events_log(), "");
    assert!(!fake.instance_dir("opensnoop").exists());
}

#[test]
fn test_install_failure_removes_instance() {
    let fake = FakeTracefs::bare(1);
    std::fs::remove_file(fake.root().join("dynamic_events")).unwrap();

    let err = Session::setup(fake.tracefs(), fake.config()).err().unwrap();
    assert!(matches!(err, SnoopError::Install { .. }), "{err}");
    assert_eq!(err.label(), "getname dynevent Create");
    assert!(!fake.instance_dir("opensnoop").exists());
    // Nothing may appear where the kernel interface was missing.
    assert!(!fake.root().join("dynamic_events").exists());
    assert!(!fake.root().join("kprobe_events").exists());
}

#[test]
fn test_filter_failure_removes_probe() {
    let fake = FakeTracefs::bare(1);
    fake.populate_instance("opensnoop", false);

    let err = Session::setup(fake.tracefs(), fake.config()).err().unwrap();
    assert!(matches!(err, SnoopError::Filter { .. }), "{err}");
    assert_eq!(err.label(), "Enable Event");
    assert_eq!(
        fake.dynamic_events_log(),
        format!("{INSTALL_LINE}{REMOVE_LINE}")
    );
}

#[test]
fn test_teardown_runs_both_steps() {
    let fake = FakeTracefs::new(1);
    let mut session = Session::setup(fake.tracefs(), fake.config()).unwrap();

    // The instance still has files in it, so rmdir refuses.
    let err = session.teardown().err().unwrap();
    assert!(matches!(err, SnoopError::Teardown { .. }), "{err}");
    assert_eq!(err.label(), "Instance Clean Up");
    assert!(fake.dynamic_events_log().ends_with(REMOVE_LINE));

    // Both handles are gone, a second teardown has nothing left to do.
    session.teardown().unwrap();
    assert_eq!(fake.dynamic_events_log().matches(REMOVE_LINE).count(), 1);
}

#[test]
fn test_teardown_twice_is_noop() {
    let fake = FakeTracefs::new(1);
    let mut session = Session::setup(fake.tracefs(), fake.config()).unwrap();
    fake.release_instance("opensnoop");

    session.teardown().unwrap();
    session.teardown().unwrap();
    drop(session);
    assert_eq!(fake.dynamic_events_log().matches(REMOVE_LINE).count(), 1);
}

#[test]
fn test_drop_cleans_up() {
    let fake = FakeTracefs::new(1);
    {
        let _session = Session::setup(fake.tracefs(), fake.config()).unwrap();
        fake.release_instance("opensnoop");
    }
    assert!(fake.dynamic_events_log().ends_with(REMOVE_LINE));
    assert!(!fake.instance_dir("opensnoop").exists());
}

#[test]
fn test_custom_probe_settings() {
    let fake = FakeTracefs::new(1);
    let config = Config {
        probe_system: Some("snoop".to_string()),
        max_active: 64,
        ..fake.config()
    };
    let err = Session::setup(fake.tracefs(), config).err().unwrap();

    // The install went through, but the fake instance has no snoop system.
    assert!(matches!(err, SnoopError::Filter { .. }), "{err}");
    assert_eq!(
        fake.dynamic_events_log(),
        "r64:snoop/getnameprobe getname +0(+0($retval)):string\n-:snoop/getnameprobe\n"
    );
}
