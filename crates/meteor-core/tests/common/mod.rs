//! Shared helpers for meteor-core's root-only integration tests.
//!
//! Isolates each test by `unshare(CLONE_NEWNET)` on the calling thread
//! rather than shelling out to `ip netns`. meteor-core's tests run on a
//! `#[tokio::test(flavor = "current_thread")]` runtime, so the unshared
//! thread stays the one and only thread driving the netlink connection for
//! the whole test, same as the real daemons do.

use std::process::Command;

/// `true` when running as root (required for `CAP_NET_ADMIN` operations).
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Skip the calling test (with a message) unless running as root.
#[macro_export]
macro_rules! require_root {
    () => {
        if !$crate::common::is_root() {
            eprintln!("skipping: requires root (CAP_NET_ADMIN)");
            return;
        }
    };
}

/// Move the calling thread into a fresh, otherwise-empty network namespace
/// so these tests never touch the host's real interfaces. Must be called
/// before opening any netlink connection.
pub fn isolate_network_namespace() {
    let rc = unsafe { libc::unshare(libc::CLONE_NEWNET) };
    assert_eq!(rc, 0, "unshare(CLONE_NEWNET) failed: {}", std::io::Error::last_os_error());
    bring_up_loopback();
}

fn bring_up_loopback() {
    let _ = Command::new("ip").args(["link", "set", "lo", "up"]).status();
}

/// Create a dummy interface (stand-in for the "physical" interface Meteor
/// normally mirrors ingress traffic from) and bring it up.
pub fn add_dummy(name: &str) {
    let status = Command::new("ip")
        .args(["link", "add", name, "type", "dummy"])
        .status()
        .expect("failed to run ip link add");
    assert!(status.success(), "failed to create dummy interface {name}");

    let status = Command::new("ip")
        .args(["link", "set", name, "up"])
        .status()
        .expect("failed to run ip link set up");
    assert!(status.success(), "failed to bring up dummy interface {name}");
}

/// Run `tc -d qdisc show dev <name>` and return stdout, used to assert on
/// installed qdisc kinds without building a netlink dump/query layer just
/// for tests.
pub fn tc_qdisc_show(dev: &str) -> String {
    let output = Command::new("tc")
        .args(["-d", "qdisc", "show", "dev", dev])
        .output()
        .expect("failed to run tc qdisc show");
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Run `tc -d class show dev <name>` and return stdout.
pub fn tc_class_show(dev: &str) -> String {
    let output = Command::new("tc")
        .args(["-d", "class", "show", "dev", dev])
        .output()
        .expect("failed to run tc class show");
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Run `tc -d filter show dev <name> parent <parent>` and return stdout.
pub fn tc_filter_show(dev: &str, parent: &str) -> String {
    let output = Command::new("tc")
        .args(["-d", "filter", "show", "dev", dev, "parent", parent])
        .output()
        .expect("failed to run tc filter show");
    String::from_utf8_lossy(&output.stdout).into_owned()
}
