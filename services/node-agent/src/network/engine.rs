//! Namespace provisioning pipeline.
//!
//! [`NetworkEngine::configure`] runs a fixed sequence of [`Step`]s. Every
//! step is one host command or a pure computation, and the first failing
//! step aborts provisioning; rerunning the pipeline converges because each
//! mutation tolerates its own "already done" output.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use stratus_id::VmId;
use stratus_networking::{parse_iface_addresses, parse_routes, MtuPlan, ResolvedBlock, Route};
use stratus_reconcile::{poll_until, PollError, PollPolicy};
use tracing::{debug, info, warn};

use super::firewall::FirewallLock;
use super::names::{IfaceNames, Macs};
use super::registry::InterfaceRegistry;
use crate::cache::{AddressPair, StateCache};
use crate::command::CommandRunner;
use crate::config::{Config, NetworkMode};
use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::state::RecordStore;
use crate::vm::{AdapterKind, PrivateAddresses, VirtualMachine, VirtualNetwork};

const FILE_EXISTS: &[&str] = &["File exists"];
const ALREADY_BRIDGED: &[&str] = &["already a member of a bridge"];
const ALREADY_EXISTS: &[&str] = &["already exists"];
const MISSING_LINK: &[&str] = &["Cannot find device", "does not exist"];
const MISSING_NAMESPACE: &[&str] = &[
    "No such file or directory",
    "does not exist",
    "setting the network namespace",
];

/// Bridge inside every VM namespace.
const INSTANCE_BRIDGE: &str = "br0";

const IFACE_POLL: PollPolicy = PollPolicy::new(100, Duration::from_millis(250));
const ADDRESS_POLL: PollPolicy = PollPolicy::new(60, Duration::from_millis(250));

/// Past this point the public address poll stops waiting for IPv6.
const ADDRESS6_WAIT: Duration = Duration::from_secs(8);

/// Provisioning steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    WaitInterfaces,
    ResolveAddresses,
    CreateNamespace,
    ResetVeths,
    CreateVeths,
    SetMtu,
    VirtLinksUp,
    ResolveBridges,
    HostAcceptRa,
    AttachBridges,
    MoveIntoNamespace,
    NamespaceSysctls,
    AntiSpoof,
    Forwarding,
    MoveTap,
    NamespaceLinksUp,
    Vlan,
    InstanceBridge,
    Gateway,
    StopLeaseClient,
    ExternalAddress,
    HostAddress,
    PublicAddress,
    Nat,
    Commit,
}

impl Step {
    pub const ALL: [Step; 25] = [
        Step::WaitInterfaces,
        Step::ResolveAddresses,
        Step::CreateNamespace,
        Step::ResetVeths,
        Step::CreateVeths,
        Step::SetMtu,
        Step::VirtLinksUp,
        Step::ResolveBridges,
        Step::HostAcceptRa,
        Step::AttachBridges,
        Step::MoveIntoNamespace,
        Step::NamespaceSysctls,
        Step::AntiSpoof,
        Step::Forwarding,
        Step::MoveTap,
        Step::NamespaceLinksUp,
        Step::Vlan,
        Step::InstanceBridge,
        Step::Gateway,
        Step::StopLeaseClient,
        Step::ExternalAddress,
        Step::HostAddress,
        Step::PublicAddress,
        Step::Nat,
        Step::Commit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::WaitInterfaces => "wait_interfaces",
            Step::ResolveAddresses => "resolve_addresses",
            Step::CreateNamespace => "create_namespace",
            Step::ResetVeths => "reset_veths",
            Step::CreateVeths => "create_veths",
            Step::SetMtu => "set_mtu",
            Step::VirtLinksUp => "virt_links_up",
            Step::ResolveBridges => "resolve_bridges",
            Step::HostAcceptRa => "host_accept_ra",
            Step::AttachBridges => "attach_bridges",
            Step::MoveIntoNamespace => "move_into_namespace",
            Step::NamespaceSysctls => "namespace_sysctls",
            Step::AntiSpoof => "anti_spoof",
            Step::Forwarding => "forwarding",
            Step::MoveTap => "move_tap",
            Step::NamespaceLinksUp => "namespace_links_up",
            Step::Vlan => "vlan",
            Step::InstanceBridge => "instance_bridge",
            Step::Gateway => "gateway",
            Step::StopLeaseClient => "stop_lease_client",
            Step::ExternalAddress => "external_address",
            Step::HostAddress => "host_address",
            Step::PublicAddress => "public_address",
            Step::Nat => "nat",
            Step::Commit => "commit",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An address taken from a configured block.
#[derive(Debug)]
struct BlockLease {
    block: ResolvedBlock,
    address: Ipv4Addr,
}

#[derive(Debug)]
struct Addressing {
    network: VirtualNetwork,
    private: Ipv4Addr,
    private6: Ipv6Addr,
    static_lease: Option<BlockLease>,
    host_lease: Option<BlockLease>,
}

#[derive(Debug)]
struct Bridges {
    external: Option<String>,
    internal: String,
    host: Option<String>,
}

/// Inputs shared by every step of one provisioning run.
struct Provision<'a> {
    vm: &'a VirtualMachine,
    names: IfaceNames,
    macs: Macs,
    external: bool,
    host: bool,
    mtu: Option<MtuPlan>,
}

impl Provision<'_> {
    fn id(&self) -> &VmId {
        &self.vm.id
    }

    fn ns(&self) -> &str {
        &self.names.namespace
    }
}

/// Builds and tears down VM network namespaces.
pub struct NetworkEngine {
    config: Arc<Config>,
    paths: Paths,
    cache: Arc<StateCache>,
    runner: Arc<dyn CommandRunner>,
    records: Arc<dyn RecordStore>,
    registry: InterfaceRegistry,
    firewall: FirewallLock,
}

impl NetworkEngine {
    pub fn new(
        config: Arc<Config>,
        paths: Paths,
        cache: Arc<StateCache>,
        runner: Arc<dyn CommandRunner>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let registry = InterfaceRegistry::from_config(&config);
        Self {
            config,
            paths,
            cache,
            runner,
            records,
            registry,
            firewall: FirewallLock::new(),
        }
    }

    pub fn registry(&self) -> &InterfaceRegistry {
        &self.registry
    }

    /// Provision the namespace and bridges of a VM's primary adapter.
    pub async fn configure(&self, vm: &VirtualMachine) -> Result<()> {
        let Some(adapter) = vm.network_adapters.first() else {
            return Err(Error::Configuration(format!(
                "{} has no network adapters",
                vm.id
            )));
        };
        if adapter.kind == AdapterKind::User {
            debug!(vm_id = %vm.id, "User-mode adapter, no namespace needed");
            return Ok(());
        }

        let p = Provision {
            vm,
            names: IfaceNames::for_vm(&vm.id),
            macs: Macs::derive(&vm.id, &adapter.network),
            external: !vm.no_public_address && !self.config.internal_only(),
            host: !vm.no_host_address && self.config.host_block.is_some(),
            mtu: MtuPlan::resolve(
                self.config.jumbo_frames,
                self.config.overlay,
                self.config.jumbo_mtu,
                self.config.normal_mtu,
            )?,
        };

        info!(
            vm_id = %vm.id,
            namespace = %p.ns(),
            external = p.external,
            host = p.host,
            "Configuring network"
        );

        self.begin(&p, Step::WaitInterfaces);
        self.wait_interfaces(&p).await?;

        self.begin(&p, Step::ResolveAddresses);
        let addressing = self.resolve_addresses(&p).await?;

        self.begin(&p, Step::CreateNamespace);
        self.runner
            .run_tolerant(FILE_EXISTS, "ip", &["netns", "add", p.ns()])
            .await?;

        self.begin(&p, Step::ResetVeths);
        self.reset_veths(&p).await;

        self.begin(&p, Step::CreateVeths);
        self.create_veths(&p).await?;

        self.begin(&p, Step::SetMtu);
        self.set_mtu(&p).await?;

        self.begin(&p, Step::VirtLinksUp);
        for virt in self.enabled_virt_ends(&p) {
            self.runner
                .run("ip", &["link", "set", "dev", virt, "up"])
                .await?;
        }

        self.begin(&p, Step::ResolveBridges);
        let bridges = self.resolve_bridges(&p, &addressing)?;

        self.begin(&p, Step::HostAcceptRa);
        self.host_accept_ra(&p, &bridges).await?;

        self.begin(&p, Step::AttachBridges);
        self.attach_bridges(&p, &bridges).await?;

        self.begin(&p, Step::MoveIntoNamespace);
        for iface in self.enabled_ns_ends(&p) {
            self.runner
                .run_tolerant(FILE_EXISTS, "ip", &["link", "set", "dev", iface, "netns", p.ns()])
                .await?;
        }

        self.begin(&p, Step::NamespaceSysctls);
        self.namespace_sysctls(&p).await?;

        self.begin(&p, Step::AntiSpoof);
        self.anti_spoof(&p, &addressing).await?;

        self.begin(&p, Step::Forwarding);
        self.in_ns(&p, &[], "sysctl", &["-w", "net.ipv4.ip_forward=1"])
            .await?;
        self.in_ns(&p, &[], "sysctl", &["-w", "net.ipv6.conf.all.forwarding=1"])
            .await?;

        self.begin(&p, Step::MoveTap);
        self.runner
            .run_tolerant(
                FILE_EXISTS,
                "ip",
                &["link", "set", "dev", &p.names.tap, "netns", p.ns()],
            )
            .await?;

        self.begin(&p, Step::NamespaceLinksUp);
        self.namespace_links_up(&p).await?;

        self.begin(&p, Step::Vlan);
        self.vlan(&p, &addressing).await?;

        self.begin(&p, Step::InstanceBridge);
        self.in_ns(&p, ALREADY_EXISTS, "brctl", &["addbr", INSTANCE_BRIDGE])
            .await?;
        for iface in [&p.names.vlan, &p.names.tap] {
            self.in_ns(&p, ALREADY_BRIDGED, "brctl", &["addif", INSTANCE_BRIDGE, iface])
                .await?;
        }

        self.begin(&p, Step::Gateway);
        self.gateway(&p, &addressing).await?;

        self.begin(&p, Step::StopLeaseClient);
        self.stop_lease_client(&p.names).await;

        self.begin(&p, Step::ExternalAddress);
        self.external_address(&p, &addressing).await?;

        self.begin(&p, Step::HostAddress);
        self.host_address(&p, &addressing).await?;

        self.begin(&p, Step::PublicAddress);
        let public = self.public_address(&p).await?;

        self.begin(&p, Step::Nat);
        self.nat(&p, &addressing, &public).await?;

        self.begin(&p, Step::Commit);
        self.commit(&p, &addressing).await?;

        info!(
            vm_id = %vm.id,
            private = %addressing.private,
            public = ?public.addr,
            public6 = ?public.addr6,
            "Network configured"
        );
        Ok(())
    }

    /// Tear down a VM's namespace and veth ends.
    ///
    /// Returns NotFound when the VM has no adapters.
    pub async fn clear(&self, vm: &VirtualMachine) -> Result<()> {
        if vm.network_adapters.is_empty() {
            return Err(Error::NotFound(format!("{} has no network adapters", vm.id)));
        }

        let names = IfaceNames::for_vm(&vm.id);
        debug!(vm_id = %vm.id, namespace = %names.namespace, "Clearing network");

        self.stop_lease_client(&names).await;

        for virt in names.virt_ends() {
            if let Err(e) = self
                .runner
                .run_tolerant(MISSING_LINK, "ip", &["link", "del", virt])
                .await
            {
                warn!(vm_id = %vm.id, iface = %virt, error = %e, "Failed to delete veth");
            }
            self.registry.remove(virt);
        }

        self.runner
            .run_tolerant(MISSING_NAMESPACE, "ip", &["netns", "del", &names.namespace])
            .await?;

        self.cache.remove_address(&vm.id).await;
        self.cache.remove_routes(&vm.id).await;
        Ok(())
    }

    /// Public address pair of a VM's external interface, through the cache.
    pub async fn public_addresses(&self, id: &VmId) -> Result<AddressPair> {
        if let Some(entry) = self.cache.get_address(id).await {
            return Ok(entry.value);
        }

        let names = IfaceNames::for_vm(id);
        let found = self.query_addresses(&names).await?;
        let pair = AddressPair {
            addr: found.v4,
            addr6: found.v6,
        };
        self.cache.set_address(*id, pair).await;
        Ok(pair)
    }

    /// Namespace route table, through the cache.
    pub async fn routes(&self, id: &VmId) -> Result<Vec<Route>> {
        if let Some(entry) = self.cache.get_routes(id).await {
            if entry.age() < self.config.refresh_rate {
                return Ok(entry.value);
            }
        }

        let names = IfaceNames::for_vm(id);
        let routes = match self
            .runner
            .query(
                MISSING_NAMESPACE,
                "ip",
                &["netns", "exec", &names.namespace, "ip", "--json", "route", "show"],
            )
            .await?
        {
            Some(json) => parse_routes(&json)?,
            None => Vec::new(),
        };

        self.cache.set_routes(*id, routes.clone()).await;
        Ok(routes)
    }

    fn begin(&self, p: &Provision<'_>, step: Step) {
        debug!(vm_id = %p.id(), step = %step, "Network step");
    }

    async fn in_ns(
        &self,
        p: &Provision<'_>,
        benign: &[&str],
        program: &str,
        args: &[&str],
    ) -> Result<String> {
        let full = ns_args(p.ns(), program, args);
        Ok(self.runner.run_tolerant(benign, "ip", &full).await?)
    }

    async fn firewall_in_ns(&self, p: &Provision<'_>, program: &str, args: &[&str]) -> Result<()> {
        let full = ns_args(p.ns(), program, args);
        self.firewall.run(self.runner.as_ref(), "ip", &full).await?;
        Ok(())
    }

    fn enabled_virt_ends<'p>(&self, p: &'p Provision<'_>) -> Vec<&'p str> {
        let mut ends = Vec::with_capacity(3);
        if p.external {
            ends.push(p.names.external_virt.as_str());
        }
        ends.push(p.names.internal_virt.as_str());
        if p.host {
            ends.push(p.names.host_virt.as_str());
        }
        ends
    }

    fn enabled_ns_ends<'p>(&self, p: &'p Provision<'_>) -> Vec<&'p str> {
        let mut ends = Vec::with_capacity(3);
        if p.external {
            ends.push(p.names.external.as_str());
        }
        ends.push(p.names.internal.as_str());
        if p.host {
            ends.push(p.names.host.as_str());
        }
        ends
    }

    async fn wait_interfaces(&self, p: &Provision<'_>) -> Result<()> {
        let sysfs = self.paths.sysfs_iface(&p.names.tap);
        let result = poll_until(IFACE_POLL, |_| {
            let sysfs = &sysfs;
            async move {
                let exists = tokio::fs::try_exists(sysfs).await?;
                Ok::<_, std::io::Error>(exists.then_some(()))
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(PollError::Exhausted { .. }) => Err(Error::Network(format!(
                "interface {} never appeared",
                p.names.tap
            ))),
            Err(PollError::Probe(e)) => Err(Error::read(sysfs.display().to_string(), e)),
        }
    }

    async fn resolve_addresses(&self, p: &Provision<'_>) -> Result<Addressing> {
        let adapter_network = p.vm.network_adapters[0].network;
        let network = self.records.get_network(&adapter_network).await?;
        let gateway = network.gateway();

        let private = self
            .records
            .lease_address(
                &network.id.to_string(),
                p.id(),
                &network.subnet,
                &[gateway],
            )
            .await?;
        let private6 = network.address6(private);

        let static_lease = match (&self.config.static_block, self.config.network_mode) {
            (Some(block), NetworkMode::Static) if p.external => {
                Some(self.lease_from_block(p, block.resolve()?).await?)
            }
            _ => None,
        };

        let host_lease = match &self.config.host_block {
            Some(block) if p.host => Some(self.lease_from_block(p, block.resolve()?).await?),
            _ => None,
        };

        Ok(Addressing {
            network,
            private,
            private6,
            static_lease,
            host_lease,
        })
    }

    async fn lease_from_block(&self, p: &Provision<'_>, block: ResolvedBlock) -> Result<BlockLease> {
        let address = self
            .records
            .lease_address(&block.name, p.id(), &block.subnet, &[block.gateway])
            .await?;
        Ok(BlockLease { block, address })
    }

    async fn reset_veths(&self, p: &Provision<'_>) {
        for virt in p.names.virt_ends() {
            self.runner
                .run_ignored("ip", &["link", "set", "dev", virt, "down"])
                .await;
            self.runner.run_ignored("ip", &["link", "del", virt]).await;
        }
        self.registry.remove(&p.names.external_virt);
        self.registry.remove(&p.names.internal_virt);
    }

    async fn create_veths(&self, p: &Provision<'_>) -> Result<()> {
        let mut pairs = Vec::with_capacity(3);
        if p.external {
            pairs.push((&p.names.external_virt, &p.names.external, p.macs.external));
        }
        pairs.push((&p.names.internal_virt, &p.names.internal, p.macs.internal));
        if p.host {
            pairs.push((&p.names.host_virt, &p.names.host, p.macs.host));
        }

        for (virt, peer, mac) in pairs {
            let mac = mac.to_string();
            self.runner
                .run(
                    "ip",
                    &["link", "add", virt, "type", "veth", "peer", "name", peer, "addr", &mac],
                )
                .await?;
        }
        Ok(())
    }

    async fn set_mtu(&self, p: &Provision<'_>) -> Result<()> {
        let Some(plan) = p.mtu else {
            return Ok(());
        };

        let mut pairs = Vec::with_capacity(3);
        if p.external {
            pairs.push((&p.names.external_virt, &p.names.external, plan.external));
        }
        pairs.push((&p.names.internal_virt, &p.names.internal, plan.internal));
        if p.host {
            pairs.push((&p.names.host_virt, &p.names.host, plan.host));
        }

        for (virt, peer, mtu) in pairs {
            let mtu = mtu.to_string();
            for iface in [virt, peer] {
                self.runner
                    .run("ip", &["link", "set", "dev", iface, "mtu", &mtu])
                    .await?;
            }
        }
        Ok(())
    }

    fn resolve_bridges(&self, p: &Provision<'_>, addressing: &Addressing) -> Result<Bridges> {
        let external = if p.external {
            let bridge = match &addressing.static_lease {
                Some(lease) => Some(lease.block.interface.clone()),
                None => self.registry.external(&p.names.external_virt),
            };
            Some(bridge.ok_or_else(|| {
                Error::Configuration("no external bridge available".to_string())
            })?)
        } else {
            None
        };

        let internal = self
            .registry
            .internal(&p.names.internal_virt, self.config.overlay)
            .ok_or_else(|| Error::Configuration("no internal bridge available".to_string()))?;

        let host = addressing
            .host_lease
            .as_ref()
            .map(|lease| lease.block.interface.clone());

        Ok(Bridges {
            external,
            internal,
            host,
        })
    }

    async fn host_accept_ra(&self, p: &Provision<'_>, bridges: &Bridges) -> Result<()> {
        let mut targets = Vec::with_capacity(2);
        if let Some(external) = &bridges.external {
            targets.push(external);
        }
        if bridges.external.as_ref() != Some(&bridges.internal) {
            targets.push(&bridges.internal);
        }

        for bridge in targets {
            let key = format!("net.ipv6.conf.{}.accept_ra=2", bridge);
            self.runner.run("sysctl", &["-w", &key]).await?;
        }
        debug!(vm_id = %p.id(), "Host router advertisements accepted");
        Ok(())
    }

    async fn attach_bridges(&self, p: &Provision<'_>, bridges: &Bridges) -> Result<()> {
        let mut attachments = Vec::with_capacity(3);
        if let Some(external) = &bridges.external {
            attachments.push((external, &p.names.external_virt));
        }
        attachments.push((&bridges.internal, &p.names.internal_virt));
        if let (true, Some(host)) = (p.host, &bridges.host) {
            attachments.push((host, &p.names.host_virt));
        }

        for (bridge, virt) in attachments {
            self.runner
                .run_tolerant(ALREADY_BRIDGED, "brctl", &["addif", bridge, virt])
                .await?;
        }
        Ok(())
    }

    async fn namespace_sysctls(&self, p: &Provision<'_>) -> Result<()> {
        self.in_ns(p, &[], "sysctl", &["-w", "net.ipv6.conf.all.accept_ra=0"])
            .await?;
        self.in_ns(p, &[], "sysctl", &["-w", "net.ipv6.conf.default.accept_ra=0"])
            .await?;
        if p.external {
            let key = format!("net.ipv6.conf.{}.accept_ra=2", p.names.external);
            self.in_ns(p, &[], "sysctl", &["-w", &key]).await?;
        }
        Ok(())
    }

    async fn anti_spoof(&self, p: &Provision<'_>, addressing: &Addressing) -> Result<()> {
        let private = format!("{}/32", addressing.private);
        let private6 = format!("{}/128", addressing.private6);

        if p.external {
            let ext = p.names.external.as_str();
            self.firewall_in_ns(
                p,
                "iptables",
                &["-I", "FORWARD", "1", "!", "-d", &private, "-i", ext, "-j", "DROP"],
            )
            .await?;
            self.firewall_in_ns(
                p,
                "ip6tables",
                &["-I", "FORWARD", "1", "!", "-d", &private6, "-i", ext, "-j", "DROP"],
            )
            .await?;
        }

        if p.host {
            self.firewall_in_ns(
                p,
                "iptables",
                &[
                    "-I",
                    "FORWARD",
                    "1",
                    "!",
                    "-d",
                    &private,
                    "-i",
                    &p.names.host,
                    "-j",
                    "DROP",
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn namespace_links_up(&self, p: &Provision<'_>) -> Result<()> {
        self.in_ns(p, &[], "ip", &["link", "set", "dev", "lo", "up"])
            .await?;
        for iface in self.enabled_ns_ends(p) {
            self.in_ns(p, &[], "ip", &["link", "set", "dev", iface, "up"])
                .await?;
        }

        if let Some(plan) = p.mtu {
            let mtu = plan.instance.to_string();
            self.in_ns(p, &[], "ip", &["link", "set", "dev", &p.names.tap, "mtu", &mtu])
                .await?;
        }
        self.in_ns(p, &[], "ip", &["link", "set", "dev", &p.names.tap, "up"])
            .await?;
        Ok(())
    }

    async fn vlan(&self, p: &Provision<'_>, addressing: &Addressing) -> Result<()> {
        let vlan_id = addressing.network.vlan_id.to_string();
        self.in_ns(
            p,
            FILE_EXISTS,
            "ip",
            &[
                "link",
                "add",
                "link",
                &p.names.internal,
                "name",
                &p.names.vlan,
                "type",
                "vlan",
                "id",
                &vlan_id,
            ],
        )
        .await?;

        if let Some(plan) = p.mtu {
            let mtu = plan.instance.to_string();
            self.in_ns(p, &[], "ip", &["link", "set", "dev", &p.names.vlan, "mtu", &mtu])
                .await?;
        }
        self.in_ns(p, &[], "ip", &["link", "set", "dev", &p.names.vlan, "up"])
            .await?;
        Ok(())
    }

    async fn gateway(&self, p: &Provision<'_>, addressing: &Addressing) -> Result<()> {
        let network = &addressing.network;
        let gateway = format!("{}/{}", network.gateway(), network.subnet.prefix_len);
        let gateway6 = format!("{}/64", network.address6(network.gateway()));

        self.in_ns(p, FILE_EXISTS, "ip", &["addr", "add", &gateway, "dev", INSTANCE_BRIDGE])
            .await?;
        self.in_ns(
            p,
            FILE_EXISTS,
            "ip",
            &["-6", "addr", "add", &gateway6, "dev", INSTANCE_BRIDGE],
        )
        .await?;
        self.in_ns(p, &[], "ip", &["link", "set", "dev", INSTANCE_BRIDGE, "up"])
            .await?;
        Ok(())
    }

    /// Kill the lease client bound to a VM's external interface, if any.
    async fn stop_lease_client(&self, names: &IfaceNames) {
        let pid_path = self.paths.dhclient_pid_path(&names.external);
        let pid = match tokio::fs::read_to_string(&pid_path).await {
            Ok(raw) => raw.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %pid_path.display(), error = %e, "Failed to read lease client pid");
                return;
            }
        };

        if !pid.is_empty() {
            self.runner.run_ignored("kill", &[&pid]).await;
        }

        if let Err(e) = tokio::fs::remove_file(&pid_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %pid_path.display(), error = %e, "Failed to remove lease client pid");
            }
        }
    }

    async fn external_address(&self, p: &Provision<'_>, addressing: &Addressing) -> Result<()> {
        if !p.external {
            return Ok(());
        }

        let ext = p.names.external.as_str();
        match &addressing.static_lease {
            Some(lease) => {
                let cidr = lease.block.cidr(lease.address);
                let via = lease.block.gateway.to_string();
                self.in_ns(p, FILE_EXISTS, "ip", &["addr", "add", &cidr, "dev", ext])
                    .await?;
                self.in_ns(p, FILE_EXISTS, "ip", &["route", "add", "default", "via", &via])
                    .await?;
            }
            None => {
                let pid_path = self.paths.dhclient_pid_path(ext);
                let pid_path = pid_path.to_string_lossy();
                let lease_path = self.paths.lease_path(p.id());
                let lease_path = lease_path.to_string_lossy();
                self.in_ns(
                    p,
                    &[],
                    "dhclient",
                    &["-pf", &pid_path, "-lf", &lease_path, ext],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn host_address(&self, p: &Provision<'_>, addressing: &Addressing) -> Result<()> {
        let Some(lease) = &addressing.host_lease else {
            return Ok(());
        };

        let cidr = lease.block.cidr(lease.address);
        self.in_ns(p, FILE_EXISTS, "ip", &["addr", "add", &cidr, "dev", &p.names.host])
            .await?;

        if !p.external {
            let via = lease.block.gateway.to_string();
            self.in_ns(p, FILE_EXISTS, "ip", &["route", "add", "default", "via", &via])
                .await?;
        }
        Ok(())
    }

    async fn query_addresses(
        &self,
        names: &IfaceNames,
    ) -> Result<stratus_networking::IfaceAddresses> {
        let output = self
            .runner
            .query(
                MISSING_NAMESPACE,
                "ip",
                &[
                    "netns",
                    "exec",
                    &names.namespace,
                    "ip",
                    "--json",
                    "addr",
                    "show",
                    "dev",
                    &names.external,
                ],
            )
            .await?;

        match output {
            Some(json) => Ok(parse_iface_addresses(&json, &names.external)?),
            None => Ok(Default::default()),
        }
    }

    /// Poll the external interface until it holds a public IPv4 address and,
    /// for a bounded time, an IPv6 address.
    async fn public_address(&self, p: &Provision<'_>) -> Result<AddressPair> {
        if !p.external {
            return Ok(AddressPair::default());
        }

        tokio::time::sleep(self.config.address_settle).await;
        let last = ADDRESS_POLL.attempts.saturating_sub(1);
        let last_v6 = ADDRESS_POLL.capped(ADDRESS6_WAIT).attempts.saturating_sub(1);

        let found = poll_until(ADDRESS_POLL, |attempt| {
            let names = &p.names;
            async move {
                let found = self.query_addresses(names).await?;
                let settled = found.v4.is_some()
                    && (found.v6.is_some() || attempt >= last_v6);
                Ok::<_, Error>((settled || attempt >= last).then_some(found))
            }
        })
        .await?;

        let Some(addr) = found.v4 else {
            return Err(Error::Network(format!(
                "{} is missing an IPv4 address",
                p.id()
            )));
        };
        if found.v6.is_none() {
            warn!(vm_id = %p.id(), namespace = %p.ns(), "Instance missing IPv6 address");
        }

        Ok(AddressPair {
            addr: Some(addr),
            addr6: found.v6,
        })
    }

    async fn nat(
        &self,
        p: &Provision<'_>,
        addressing: &Addressing,
        public: &AddressPair,
    ) -> Result<()> {
        let private = addressing.private.to_string();
        let private_cidr = format!("{}/32", addressing.private);

        if let (true, Some(addr)) = (p.external, public.addr) {
            let ext = p.names.external.as_str();
            let addr = addr.to_string();
            self.masquerade(p, "iptables", &private_cidr, ext).await?;
            self.dnat(p, "iptables", &addr, &private).await?;

            if let Some(addr6) = public.addr6 {
                let private6 = addressing.private6.to_string();
                let private6_cidr = format!("{}/128", addressing.private6);
                let addr6 = addr6.to_string();
                self.masquerade(p, "ip6tables", &private6_cidr, ext).await?;
                self.dnat(p, "ip6tables", &addr6, &private6).await?;
            }
        }

        if let Some(lease) = &addressing.host_lease {
            let host_addr = lease.address.to_string();
            self.masquerade(p, "iptables", &private_cidr, &p.names.host)
                .await?;
            self.dnat(p, "iptables", &host_addr, &private).await?;
        }
        Ok(())
    }

    async fn masquerade(&self, p: &Provision<'_>, program: &str, source: &str, out: &str) -> Result<()> {
        self.firewall_in_ns(
            p,
            program,
            &["-t", "nat", "-A", "POSTROUTING", "-s", source, "-o", out, "-j", "MASQUERADE"],
        )
        .await
    }

    async fn dnat(&self, p: &Provision<'_>, program: &str, dest: &str, to: &str) -> Result<()> {
        self.firewall_in_ns(
            p,
            program,
            &["-t", "nat", "-A", "PREROUTING", "-d", dest, "-j", "DNAT", "--to-destination", to],
        )
        .await
    }

    async fn commit(&self, p: &Provision<'_>, addressing: &Addressing) -> Result<()> {
        self.cache.remove_address(p.id()).await;
        self.cache.remove_routes(p.id()).await;

        let addresses = PrivateAddresses {
            private_ips: vec![addressing.private],
            private_ips6: vec![addressing.private6],
            host_ips: addressing
                .host_lease
                .as_ref()
                .map(|lease| vec![lease.address])
                .unwrap_or_default(),
        };

        match self.records.commit_addresses(p.id(), &addresses).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(vm_id = %p.id(), "Instance gone before addresses were committed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn ns_args<'a>(ns: &'a str, program: &'a str, args: &[&'a str]) -> Vec<&'a str> {
    let mut full = Vec::with_capacity(args.len() + 4);
    full.extend_from_slice(&["netns", "exec", ns, program]);
    full.extend_from_slice(args);
    full
}
