use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::arp::ArpResponder;
use crate::interfaces::{Interface, InterfaceSource, qualify};
use crate::ndp::NdpResponder;
use crate::Result;

pub const INTERFACE_SCAN_INTERVAL: Duration = Duration::from_secs(10);
/// How long an IP keeps being re-announced after a change.
pub const SPAM_WINDOW: Duration = Duration::from_secs(5);
pub const SPAM_TICK: Duration = Duration::from_millis(1100);

/// Why a responder did not answer a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    None,
    ArpReply,
    MessageType,
    NoSourceLL,
    Error,
    /// No balancer owns the IP.
    AnnounceIp,
    /// The IP is owned but restricted to other interfaces.
    NotMatchInterface,
}

pub type ShouldAnnounce = Arc<dyn Fn(IpAddr, &str) -> DropReason + Send + Sync>;

/// An IP to announce, optionally restricted to some interfaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpAdvertisement {
    ip: IpAddr,
    interfaces: BTreeSet<String>,
}

impl IpAdvertisement {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            interfaces: BTreeSet::new(),
        }
    }

    pub fn with_interfaces<I, S>(ip: IpAddr, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ip,
            interfaces: interfaces.into_iter().map(Into::into).collect(),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn all_interfaces(&self) -> bool {
        self.interfaces.is_empty()
    }

    pub fn match_interface(&self, intf: &str) -> bool {
        self.all_interfaces() || self.interfaces.contains(intf)
    }
}

/// One raw-socket listener bound to an interface.
pub trait Responder: Send + Sync {
    fn interface(&self) -> &str;
    fn gratuitous(&self, ip: IpAddr) -> Result<()>;
    /// Starts receiving solicitations for `ip`.
    fn watch(&self, ip: IpAddr) -> Result<()>;
    fn unwatch(&self, ip: IpAddr) -> Result<()>;
    fn close(&self);
}

pub trait ResponderFactory: Send + Sync {
    fn arp(&self, intf: &Interface, should_announce: ShouldAnnounce)
    -> Result<Arc<dyn Responder>>;
    fn ndp(&self, intf: &Interface, should_announce: ShouldAnnounce)
    -> Result<Arc<dyn Responder>>;
}

/// Opens real ARP and NDP sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketResponderFactory;

impl ResponderFactory for SocketResponderFactory {
    fn arp(
        &self,
        intf: &Interface,
        should_announce: ShouldAnnounce,
    ) -> Result<Arc<dyn Responder>> {
        Ok(Arc::new(ArpResponder::new(intf, should_announce)?))
    }

    fn ndp(
        &self,
        intf: &Interface,
        should_announce: ShouldAnnounce,
    ) -> Result<Arc<dyn Responder>> {
        Ok(Arc::new(NdpResponder::new(intf, should_announce)?))
    }
}

#[derive(Default)]
struct State {
    ips: HashMap<String, Vec<IpAdvertisement>>,
    ip_refcnt: HashMap<IpAddr, usize>,
    arps: HashMap<u32, Arc<dyn Responder>>,
    ndps: HashMap<u32, Arc<dyn Responder>>,
}

impl State {
    fn should_announce(&self, ip: IpAddr, intf: &str) -> DropReason {
        let mut found = false;
        for adv in self.ips.values().flatten() {
            if adv.ip == ip {
                found = true;
                if adv.match_interface(intf) {
                    return DropReason::None;
                }
            }
        }
        if found {
            DropReason::NotMatchInterface
        } else {
            DropReason::AnnounceIp
        }
    }
}

/// Answers ARP and NDP for the IPs owned by named balancers.
pub struct Announce {
    state: Arc<RwLock<State>>,
    spam_tx: mpsc::UnboundedSender<IpAdvertisement>,
    exclude: Option<Regex>,
    factory: Arc<dyn ResponderFactory>,
    interfaces: Arc<dyn InterfaceSource>,
}

impl Announce {
    /// The returned [`SpamLoop`] must be driven for gratuitous announcements
    /// to be sent.
    pub fn new(
        exclude: Option<Regex>,
        factory: Arc<dyn ResponderFactory>,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> (Arc<Self>, SpamLoop) {
        let (spam_tx, spam_rx) = mpsc::unbounded_channel();
        let announce = Arc::new(Self {
            state: Arc::new(RwLock::new(State::default())),
            spam_tx,
            exclude,
            factory,
            interfaces,
        });
        let spam = SpamLoop {
            announce: Arc::downgrade(&announce),
            rx: spam_rx,
        };
        (announce, spam)
    }

    /// Builds the announcer and spawns the interface scan and spam loop.
    pub fn start(
        exclude: Option<Regex>,
        factory: Arc<dyn ResponderFactory>,
        interfaces: Arc<dyn InterfaceSource>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (announce, spam) = Self::new(exclude, factory, interfaces);
        tokio::spawn(spam.run(cancel.clone()));
        tokio::spawn(announce.clone().interface_scan(cancel));
        announce
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn interface_scan(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(INTERFACE_SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.update_interfaces(),
            }
        }
        self.close_all();
    }

    fn should_announce_fn(&self) -> ShouldAnnounce {
        let state: Weak<RwLock<State>> = Arc::downgrade(&self.state);
        Arc::new(move |ip, intf| match state.upgrade() {
            Some(state) => state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .should_announce(ip, intf),
            None => DropReason::AnnounceIp,
        })
    }

    /// Creates responders for newly qualifying interfaces and closes the
    /// ones whose interface no longer qualifies.
    pub fn update_interfaces(&self) {
        let interfaces = match self.interfaces.interfaces() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                error!(error = %e, "couldn't list interfaces");
                return;
            }
        };

        let mut state = self.write();
        let mut keep_arp = BTreeSet::new();
        let mut keep_ndp = BTreeSet::new();
        for intf in &interfaces {
            let q = qualify(intf, self.exclude.as_ref());
            if q.arp {
                keep_arp.insert(intf.index);
                if !state.arps.contains_key(&intf.index) {
                    match self.factory.arp(intf, self.should_announce_fn()) {
                        Ok(resp) => {
                            state.arps.insert(intf.index, resp);
                        }
                        Err(e) => {
                            error!(interface = %intf.name, error = %e, "failed to create ARP responder");
                        }
                    }
                }
            }
            if q.ndp {
                keep_ndp.insert(intf.index);
                if !state.ndps.contains_key(&intf.index) {
                    match self.factory.ndp(intf, self.should_announce_fn()) {
                        Ok(resp) => {
                            for ip in state.ip_refcnt.keys().filter(|ip| ip.is_ipv6()) {
                                if let Err(e) = resp.watch(*ip) {
                                    warn!(interface = %intf.name, %ip, error = %e, "failed to watch NDP multicast group");
                                }
                            }
                            state.ndps.insert(intf.index, resp);
                        }
                        Err(e) => {
                            error!(interface = %intf.name, error = %e, "failed to create NDP responder");
                        }
                    }
                }
            }
        }

        state.arps.retain(|index, resp| {
            let keep = keep_arp.contains(index);
            if !keep {
                resp.close();
            }
            keep
        });
        state.ndps.retain(|index, resp| {
            let keep = keep_ndp.contains(index);
            if !keep {
                resp.close();
            }
            keep
        });
    }

    fn close_all(&self) {
        let mut guard = self.write();
        let state = &mut *guard;
        for (_, resp) in state.arps.drain().chain(state.ndps.drain()) {
            resp.close();
        }
    }

    /// Registers `adv` under balancer `name` and schedules re-announcement.
    /// Registering an IP a second time for the same name only replaces its
    /// interface restriction.
    pub fn set_balancer(&self, name: &str, adv: IpAdvertisement) {
        self.set_balancer_locked(name, adv.clone());
        // Sent after the lock is released.
        if self.spam_tx.send(adv).is_err() {
            warn!(balancer = name, "spam loop is not running");
        }
    }

    fn set_balancer_locked(&self, name: &str, adv: IpAdvertisement) {
        let mut state = self.write();
        let advs = state.ips.entry(name.to_owned()).or_default();
        if let Some(existing) = advs.iter_mut().find(|a| a.ip == adv.ip) {
            *existing = adv;
            return;
        }
        let ip = adv.ip;
        advs.push(adv);

        let count = state.ip_refcnt.entry(ip).or_default();
        *count += 1;
        if *count > 1 {
            return;
        }
        if ip.is_ipv6() {
            for resp in state.ndps.values() {
                if let Err(e) = resp.watch(ip) {
                    warn!(interface = resp.interface(), %ip, error = %e, "failed to watch NDP multicast group");
                }
            }
        }
        info!(balancer = name, %ip, "announcing ip");
    }

    /// Drops balancer `name`. IPs still owned by another balancer stay
    /// announced.
    pub fn delete_balancer(&self, name: &str) {
        let mut state = self.write();
        let Some(advs) = state.ips.remove(name) else {
            return;
        };
        for adv in advs {
            let Some(count) = state.ip_refcnt.get_mut(&adv.ip) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count > 0 {
                continue;
            }
            state.ip_refcnt.remove(&adv.ip);
            if adv.ip.is_ipv6() {
                for resp in state.ndps.values() {
                    if let Err(e) = resp.unwatch(adv.ip) {
                        warn!(interface = resp.interface(), ip = %adv.ip, error = %e, "failed to unwatch NDP multicast group");
                    }
                }
            }
            info!(balancer = name, ip = %adv.ip, "stopped announcing ip");
        }
    }

    pub fn announce_name(&self, name: &str) -> bool {
        self.read().ips.contains_key(name)
    }

    pub fn balancers(&self) -> Vec<String> {
        self.read().ips.keys().cloned().collect()
    }

    pub fn ip_refcount(&self, ip: IpAddr) -> usize {
        self.read().ip_refcnt.get(&ip).copied().unwrap_or_default()
    }

    pub fn should_announce(&self, ip: IpAddr, intf: &str) -> DropReason {
        self.read().should_announce(ip, intf)
    }

    /// Sends a gratuitous ARP/NDP for `adv` unless no balancer owns it
    /// anymore.
    pub fn gratuitous(&self, adv: &IpAdvertisement) -> Result<()> {
        let state = self.read();
        if state.ip_refcnt.get(&adv.ip).copied().unwrap_or_default() == 0 {
            return Ok(());
        }
        let responders = if adv.ip.is_ipv4() {
            &state.arps
        } else {
            &state.ndps
        };
        for resp in responders.values() {
            if adv.match_interface(resp.interface()) {
                resp.gratuitous(adv.ip)?;
            }
        }
        Ok(())
    }
}

/// Coalesces re-announcement requests into a per-IP window.
pub struct SpamLoop {
    announce: Weak<Announce>,
    rx: mpsc::UnboundedReceiver<IpAdvertisement>,
}

impl SpamLoop {
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut windows: HashMap<IpAddr, (Instant, IpAdvertisement)> = HashMap::new();
        // Only ticks while some IP is inside its window.
        let mut ticker: Option<Interval> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                adv = self.rx.recv() => {
                    let Some(adv) = adv else {
                        return;
                    };
                    let until = Instant::now() + SPAM_WINDOW;
                    if windows.insert(adv.ip, (until, adv.clone())).is_none() {
                        self.gratuitous(&adv);
                    }
                    if ticker.is_none() {
                        ticker = Some(tokio::time::interval_at(Instant::now() + SPAM_TICK, SPAM_TICK));
                    }
                }
                now = tick(&mut ticker) => {
                    let mut due = Vec::new();
                    windows.retain(|_, (until, adv)| {
                        let keep = now <= *until;
                        if keep {
                            due.push(adv.clone());
                        }
                        keep
                    });
                    for adv in &due {
                        self.gratuitous(adv);
                    }
                    if windows.is_empty() {
                        ticker = None;
                    }
                }
            }
        }
    }

    fn gratuitous(&self, adv: &IpAdvertisement) {
        let Some(announce) = self.announce.upgrade() else {
            return;
        };
        if let Err(e) = announce.gratuitous(adv) {
            warn!(ip = %adv.ip, error = %e, "failed to send gratuitous announcement");
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Watch(String, IpAddr),
        Unwatch(String, IpAddr),
        Gratuitous(String, IpAddr),
        Close(String),
    }

    type Calls = Arc<Mutex<Vec<Call>>>;

    struct FakeResponder {
        interface: String,
        calls: Calls,
    }

    impl Responder for FakeResponder {
        fn interface(&self) -> &str {
            &self.interface
        }

        fn gratuitous(&self, ip: IpAddr) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Gratuitous(self.interface.clone(), ip));
            Ok(())
        }

        fn watch(&self, ip: IpAddr) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Watch(self.interface.clone(), ip));
            Ok(())
        }

        fn unwatch(&self, ip: IpAddr) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Unwatch(self.interface.clone(), ip));
            Ok(())
        }

        fn close(&self) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Close(self.interface.clone()));
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        calls: Calls,
    }

    impl ResponderFactory for FakeFactory {
        fn arp(&self, intf: &Interface, _: ShouldAnnounce) -> Result<Arc<dyn Responder>> {
            Ok(Arc::new(FakeResponder {
                interface: intf.name.clone(),
                calls: self.calls.clone(),
            }))
        }

        fn ndp(&self, intf: &Interface, _: ShouldAnnounce) -> Result<Arc<dyn Responder>> {
            Ok(Arc::new(FakeResponder {
                interface: intf.name.clone(),
                calls: self.calls.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct FakeInterfaces(Mutex<Vec<Interface>>);

    impl InterfaceSource for FakeInterfaces {
        fn interfaces(&self) -> Result<Vec<Interface>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn intf(name: &str, index: u32) -> Interface {
        Interface {
            name: name.to_owned(),
            index,
            mac: Some([0x02, 0, 0, 0, 0, index as u8]),
            up: true,
            broadcast: true,
            ipv6: vec![Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, index as u16)],
            ..Default::default()
        }
    }

    struct Harness {
        announce: Arc<Announce>,
        spam: Option<SpamLoop>,
        calls: Calls,
        interfaces: Arc<FakeInterfaces>,
    }

    fn harness(interfaces: Vec<Interface>) -> Harness {
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let source = Arc::new(FakeInterfaces(Mutex::new(interfaces)));
        let (announce, spam) = Announce::new(
            Some(Regex::new("^lo$").unwrap()),
            Arc::new(factory),
            source.clone(),
        );
        announce.update_interfaces();
        Harness {
            announce,
            spam: Some(spam),
            calls,
            interfaces: source,
        }
    }

    impl Harness {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| f(c)).count()
        }
    }

    fn v6() -> IpAddr {
        IpAddr::V6("fd00::100".parse().unwrap())
    }

    fn v4() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 6, 1, 100))
    }

    #[test]
    fn test_shared_ip_refcount() {
        let h = harness(vec![intf("eth0", 2)]);
        let ip = v6();

        h.announce.set_balancer("a", IpAdvertisement::new(ip));
        h.announce.set_balancer("b", IpAdvertisement::new(ip));
        assert_eq!(h.announce.ip_refcount(ip), 2);
        assert_eq!(h.count(|c| matches!(c, Call::Watch(..))), 1);

        h.announce.delete_balancer("a");
        assert!(!h.announce.announce_name("a"));
        assert!(h.announce.announce_name("b"));
        assert_eq!(h.announce.ip_refcount(ip), 1);
        assert_eq!(h.announce.should_announce(ip, "eth0"), DropReason::None);
        assert_eq!(h.count(|c| matches!(c, Call::Unwatch(..))), 0);

        h.announce.delete_balancer("b");
        assert_eq!(h.announce.ip_refcount(ip), 0);
        assert_eq!(h.announce.should_announce(ip, "eth0"), DropReason::AnnounceIp);
        assert_eq!(
            h.count(|c| *c == Call::Unwatch("eth0".to_owned(), ip)),
            1
        );
    }

    #[test]
    fn test_set_balancer_idempotent() {
        let h = harness(vec![intf("eth0", 2), intf("eth1", 3)]);
        let ip = v4();

        h.announce.set_balancer("a", IpAdvertisement::new(ip));
        h.announce
            .set_balancer("a", IpAdvertisement::with_interfaces(ip, ["eth1"]));
        assert_eq!(h.announce.ip_refcount(ip), 1);
        assert_eq!(h.announce.balancers(), vec!["a".to_owned()]);

        // The restriction was replaced.
        assert_eq!(
            h.announce.should_announce(ip, "eth0"),
            DropReason::NotMatchInterface
        );
        assert_eq!(h.announce.should_announce(ip, "eth1"), DropReason::None);

        h.announce.delete_balancer("a");
        assert!(!h.announce.announce_name("a"));
        assert_eq!(h.announce.ip_refcount(ip), 0);
    }

    #[test]
    fn test_ipv4_does_not_watch() {
        let h = harness(vec![intf("eth0", 2)]);
        h.announce.set_balancer("a", IpAdvertisement::new(v4()));
        h.announce.delete_balancer("a");
        assert_eq!(
            h.count(|c| matches!(c, Call::Watch(..) | Call::Unwatch(..))),
            0
        );
    }

    #[test]
    fn test_update_interfaces() {
        let mut down = intf("eth2", 4);
        down.up = false;
        let h = harness(vec![intf("lo", 1), intf("eth0", 2), down]);
        {
            let state = h.announce.read();
            assert_eq!(state.arps.keys().copied().collect::<Vec<_>>(), vec![2]);
            assert_eq!(state.ndps.keys().copied().collect::<Vec<_>>(), vec![2]);
        }

        h.announce.set_balancer("a", IpAdvertisement::new(v6()));

        // A new NDP interface watches IPs that are already owned.
        h.interfaces.0.lock().unwrap().push(intf("eth1", 3));
        h.announce.update_interfaces();
        assert!(h.calls().contains(&Call::Watch("eth1".to_owned(), v6())));

        // eth0 goes away.
        h.interfaces.0.lock().unwrap().retain(|i| i.name != "eth0");
        h.announce.update_interfaces();
        assert_eq!(h.count(|c| *c == Call::Close("eth0".to_owned())), 2);
        let state = h.announce.read();
        assert_eq!(state.arps.keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(state.ndps.keys().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_gratuitous_respects_interfaces_and_ownership() {
        let h = harness(vec![intf("eth0", 2), intf("eth1", 3)]);
        let adv = IpAdvertisement::with_interfaces(v4(), ["eth1"]);

        h.announce.gratuitous(&adv).unwrap();
        assert_eq!(h.count(|c| matches!(c, Call::Gratuitous(..))), 0);

        h.announce.set_balancer("a", adv.clone());
        h.announce.gratuitous(&adv).unwrap();
        assert_eq!(
            h.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Gratuitous(..)))
                .collect::<Vec<_>>(),
            vec![Call::Gratuitous("eth1".to_owned(), v4())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_spam_window() {
        let mut h = harness(vec![intf("eth0", 2)]);
        let cancel = CancellationToken::new();
        let spam = h.spam.take().unwrap();
        let handle = tokio::spawn(spam.run(cancel.clone()));

        h.announce.set_balancer("a", IpAdvertisement::new(v4()));
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Once immediately, then at 1.1s, 2.2s, 3.3s and 4.4s.
        assert_eq!(h.count(|c| matches!(c, Call::Gratuitous(..))), 5);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spam_stops_when_ownership_lost() {
        let mut h = harness(vec![intf("eth0", 2)]);
        let cancel = CancellationToken::new();
        let spam = h.spam.take().unwrap();
        let handle = tokio::spawn(spam.run(cancel.clone()));

        h.announce.set_balancer("a", IpAdvertisement::new(v4()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.announce.delete_balancer("a");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.count(|c| matches!(c, Call::Gratuitous(..))), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
