use super::*;
use crate::peer::PeerAuthorizeResponse;
use maplit::btreemap;
use mesh_control_plane_core::{
    Endpoint, ImportSource, LbScheme, PolicyAction, Selector, WorkloadSetOrSelector,
};
use mesh_control_plane_index::ControlIndex;
use parking_lot::Mutex;
use std::{sync::Barrier, thread, time::Duration};

#[tokio::test]
async fn egress_allowed() {
    let (manager, peers) = mk_manager(&[("east", Ok(granted("tok-0")))]);
    manager.add_import(mk_import(&["east"])).unwrap();
    allow_all(&manager, "ns-0");

    let rsp = manager.authorize_egress(egress()).await.unwrap();
    assert_eq!(
        rsp,
        EgressResponse {
            service_exists: true,
            allowed: true,
            target_cluster: Some("remote-peer/east".to_string()),
            access_token: Some("tok-0".to_string()),
        }
    );
    assert_eq!(
        peers["east"].requests(),
        vec![PeerAuthorizeRequest {
            service_name: "svc".to_string(),
            service_namespace: "default".to_string(),
        }]
    );
}

#[tokio::test]
async fn egress_unknown_import() {
    let (manager, _) = mk_manager(&[]);
    let rsp = manager.authorize_egress(egress()).await.unwrap();
    assert!(!rsp.service_exists);
    assert!(!rsp.allowed);
}

#[tokio::test]
async fn egress_denied_locally() {
    let (manager, peers) = mk_manager(&[("east", Ok(granted("tok-0")))]);
    manager.add_import(mk_import(&["east"])).unwrap();

    let rsp = manager.authorize_egress(egress()).await.unwrap();
    assert!(rsp.service_exists);
    assert!(!rsp.allowed);
    assert_eq!(rsp.access_token, None);
    assert!(peers["east"].requests().is_empty(), "peer must not be asked");
}

#[tokio::test]
async fn egress_propagates_remote_denial() {
    let (manager, _) = mk_manager(&[(
        "east",
        Ok(PeerAuthorizeResponse {
            service_exists: true,
            allowed: false,
            access_token: None,
        }),
    )]);
    manager.add_import(mk_import(&["east"])).unwrap();
    allow_all(&manager, "ns-0");

    let rsp = manager.authorize_egress(egress()).await.unwrap();
    assert!(rsp.service_exists);
    assert!(!rsp.allowed);
    assert_eq!(rsp.target_cluster, None);
}

#[tokio::test]
async fn egress_only_consults_app_label() {
    let (manager, _) = mk_manager(&[("east", Ok(granted("tok-0")))]);
    manager.add_import(mk_import(&["east"])).unwrap();
    manager
        .add_policy(mk_policy(
            ResourceId::new("ns-0", "frontend"),
            Selector::from_iter(Some(("tier", "frontend"))),
            Selector::default(),
        ))
        .unwrap();

    let rsp = manager.authorize_egress(egress()).await.unwrap();
    assert!(!rsp.allowed, "the tier label is not a source attribute");

    manager
        .add_policy(mk_policy(
            ResourceId::new("ns-0", "client"),
            Selector::from_iter(Some(("app", "client"))),
            Selector::default(),
        ))
        .unwrap();
    let rsp = manager.authorize_egress(egress()).await.unwrap();
    assert!(rsp.allowed);
}

#[tokio::test]
async fn egress_fails_over_to_next_peer() {
    let (manager, peers) = mk_manager(&[("east", Err(())), ("west", Ok(granted("tok-w")))]);
    manager.add_import(mk_import(&["east", "west"])).unwrap();
    allow_all(&manager, "ns-0");

    let rsp = manager.authorize_egress(egress()).await.unwrap();
    assert_eq!(rsp.target_cluster.as_deref(), Some("remote-peer/west"));
    assert_eq!(rsp.access_token.as_deref(), Some("tok-w"));
    assert_eq!(peers["east"].requests().len(), 1);
}

#[tokio::test]
async fn egress_reports_peer_error_when_exhausted() {
    let (manager, peers) = mk_manager(&[("east", Err(()))]);
    manager.add_import(mk_import(&["east"])).unwrap();
    allow_all(&manager, "ns-0");

    let error = manager.authorize_egress(egress()).await.unwrap_err();
    assert!(
        matches!(&error, AuthzError::Peer { peer, .. } if peer == "east"),
        "{error}"
    );
    assert_eq!(error.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        peers["east"].requests().len(),
        2,
        "the delayed source is retried once"
    );
}

#[tokio::test]
async fn egress_missing_client() {
    let (manager, _) = mk_manager(&[]);
    manager.add_import(mk_import(&["east"])).unwrap();
    allow_all(&manager, "ns-0");
    // Enabled for routing without a registered client.
    manager.decider.add_peer("east");

    let error = manager.authorize_egress(egress()).await.unwrap_err();
    assert!(matches!(&error, AuthzError::MissingClient(peer) if peer == "east"));
    assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn egress_unreachable_peers_exhaust_routing() {
    let (manager, _) = mk_manager(&[("east", Ok(granted("tok-0")))]);
    manager.add_import(mk_import(&["east"])).unwrap();
    allow_all(&manager, "ns-0");
    manager.set_peer_reachable("east", false);

    let error = manager.authorize_egress(egress()).await.unwrap_err();
    assert!(matches!(
        error,
        AuthzError::Route(RouteError::Exhausted { sources: 1 })
    ));
}

#[test]
fn ingress_issues_verifiable_token() {
    let (manager, _) = mk_manager(&[]);
    let export = ResourceId::new("ns-0", "svc");
    manager.add_export(Export {
        id: export.clone(),
        host: "svc.ns-0".to_string(),
        port: 8080,
    });
    manager
        .add_policy(mk_policy(
            ResourceId::new("ns-0", "from-east"),
            Selector::from_iter(Some((PEER_NAME_LABEL, "east"))),
            Selector::default(),
        ))
        .unwrap();

    let rsp = manager
        .authorize_ingress(IngressRequest {
            service: export.clone(),
            peer: "east".to_string(),
        })
        .unwrap();
    assert!(rsp.service_exists);
    assert!(rsp.allowed);
    let token = rsp.access_token.unwrap();
    assert_eq!(manager.verify_token(&token).unwrap(), "export/ns-0/svc");

    let rsp = manager
        .authorize_ingress(IngressRequest {
            service: export,
            peer: "west".to_string(),
        })
        .unwrap();
    assert!(rsp.service_exists);
    assert!(!rsp.allowed);
    assert_eq!(rsp.access_token, None);
}

#[test]
fn ingress_unknown_export() {
    let (manager, _) = mk_manager(&[]);
    let rsp = manager
        .authorize_ingress(IngressRequest {
            service: ResourceId::new("ns-0", "svc"),
            peer: "east".to_string(),
        })
        .unwrap();
    assert_eq!(rsp, IngressResponse::default());
}

#[test]
fn invalid_token() {
    let (manager, _) = mk_manager(&[]);
    let error = manager.verify_token("garbage").unwrap_err();
    assert_eq!(error.status(), StatusCode::UNAUTHORIZED);
}

#[test]
fn import_ports() {
    let (manager, _) = mk_manager(&[]);
    let a = manager.add_import(mk_import(&["east"])).unwrap();
    assert!(mesh_control_plane_index::ports::PORT_RANGE.contains(&a.target_port));

    let mut b = mk_import(&["east"]);
    b.id = ResourceId::new("ns-0", "other");
    b.target_port = a.target_port;
    let error = manager.add_import(b.clone()).unwrap_err();
    assert_eq!(error.status(), StatusCode::CONFLICT);
    assert!(error.to_string().contains("ns-0/svc"), "{error}");

    manager.delete_import(&a.id);
    assert_eq!(manager.add_import(b).unwrap().target_port, a.target_port);
}

#[test]
fn peer_lifecycle() {
    let (manager, _) = mk_manager_with(&[("east", Ok(granted("tok-0")))], false);
    assert_eq!(manager.peer_clients().len(), 1);
    assert_eq!(manager.decider.sizes().peers, 0, "unreachable peers are not routable");

    manager.set_peer_reachable("east", true);
    assert_eq!(manager.decider.sizes().peers, 1);

    manager.delete_peer("east");
    assert!(manager.peer_clients().is_empty());
    assert_eq!(manager.decider.sizes().peers, 0);

    manager.set_peer_reachable("east", true);
    assert_eq!(manager.decider.sizes().peers, 0, "deleted peers stay unroutable");
}

#[test]
fn reachability_does_not_resurrect_deleted_peers() {
    let fakes = Fakes::from_iter([(
        "east".to_string(),
        Arc::new(FakePeer {
            response: Ok(granted("tok-0")),
            requests: Mutex::new(vec![]),
        }),
    )]);
    let manager = Arc::new(Manager::new(
        Arc::new(GatedDecider::default()),
        Arc::new(FakeConnect(fakes)),
        crate::token::tests::tokens(),
        AuthzMetrics::default(),
    ));
    manager
        .add_peer(
            Peer {
                name: "east".to_string(),
                gateways: vec![Endpoint {
                    host: "gw.east".to_string(),
                    port: 443,
                }],
            },
            false,
        )
        .unwrap();

    let reachable = thread::spawn({
        let manager = manager.clone();
        move || manager.set_peer_reachable("east", true)
    });
    // Enabling the peer is paused inside the decider.
    manager.decider.entered.wait();
    let delete = thread::spawn({
        let manager = manager.clone();
        move || manager.delete_peer("east")
    });
    thread::sleep(Duration::from_millis(50));
    manager.decider.release.wait();
    reachable.join().unwrap();
    delete.join().unwrap();

    assert!(manager.peer_clients().is_empty());
    assert_eq!(manager.decider.inner.sizes().peers, 0);
}

#[test]
fn lease_exhaustion_is_unavailable() {
    let error = AuthzError::from(LeaseError::Exhausted);
    assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[test]
fn peer_without_gateways() {
    let (manager, _) = mk_manager(&[]);
    let error = manager
        .add_peer(
            Peer {
                name: "south".to_string(),
                gateways: vec![],
            },
            true,
        )
        .unwrap_err();
    assert!(matches!(error, AuthzError::Connect(PeerError::NoGateways(_))));
    assert!(manager.peer_clients().is_empty());
}

// === fakes ===

pub(crate) struct FakePeer {
    response: Result<PeerAuthorizeResponse, ()>,
    requests: Mutex<Vec<PeerAuthorizeRequest>>,
}

struct FakeConnect(HashMap<String, Arc<FakePeer>>);

impl FakePeer {
    fn requests(&self) -> Vec<PeerAuthorizeRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl PeerApi for FakePeer {
    async fn authorize(
        &self,
        req: &PeerAuthorizeRequest,
    ) -> Result<PeerAuthorizeResponse, PeerError> {
        self.requests.lock().push(req.clone());
        self.response
            .clone()
            .map_err(|()| PeerError::AllFailed(vec![]))
    }

    async fn heartbeat(&self) -> Result<(), PeerError> {
        self.response
            .as_ref()
            .map(|_| ())
            .map_err(|()| PeerError::AllFailed(vec![]))
    }
}

impl Connect for FakeConnect {
    fn connect(&self, peer: &Peer) -> Result<Arc<dyn PeerApi>, PeerError> {
        match self.0.get(&peer.name) {
            Some(fake) if !peer.gateways.is_empty() => Ok(fake.clone()),
            _ => Err(PeerError::NoGateways(peer.name.clone())),
        }
    }
}

/// Blocks `add_peer` until the test releases it.
struct GatedDecider {
    inner: ControlIndex,
    entered: Barrier,
    release: Barrier,
}

impl Default for GatedDecider {
    fn default() -> Self {
        Self {
            inner: ControlIndex::default(),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl Decider for GatedDecider {
    fn authorize_and_route(
        &self,
        req: &ConnectionRequest,
        attempt: &mut RouteAttempt,
    ) -> Result<mesh_control_plane_core::ConnectionResponse, RouteError> {
        self.inner.authorize_and_route(req, attempt)
    }

    fn add_peer(&self, name: &str) {
        self.entered.wait();
        self.release.wait();
        self.inner.add_peer(name)
    }

    fn delete_peer(&self, name: &str) {
        self.inner.delete_peer(name)
    }

    fn add_import(&self, import: Import) {
        self.inner.add_import(import)
    }

    fn delete_import(&self, id: &ResourceId) {
        self.inner.delete_import(id)
    }

    fn add_export(&self, export: Export) {
        self.inner.add_export(export)
    }

    fn delete_export(&self, id: &ResourceId) {
        self.inner.delete_export(id)
    }

    fn add_policy(&self, policy: AccessPolicy) -> Result<(), PolicyError> {
        self.inner.add_policy(policy)
    }

    fn delete_policy(&self, id: &ResourceId, privileged: bool) -> Result<(), PolicyError> {
        self.inner.delete_policy(id, privileged)
    }
}

pub(crate) type Fakes = HashMap<String, Arc<FakePeer>>;

pub(crate) fn mk_manager(
    peers: &[(&str, Result<PeerAuthorizeResponse, ()>)],
) -> (Manager<ControlIndex>, Fakes) {
    mk_manager_with(peers, true)
}

fn mk_manager_with(
    peers: &[(&str, Result<PeerAuthorizeResponse, ()>)],
    reachable: bool,
) -> (Manager<ControlIndex>, Fakes) {
    let fakes = peers
        .iter()
        .map(|(name, response)| {
            let fake = Arc::new(FakePeer {
                response: response.clone(),
                requests: Mutex::new(vec![]),
            });
            (name.to_string(), fake)
        })
        .collect::<Fakes>();

    let manager = Manager::new(
        ControlIndex::shared(),
        Arc::new(FakeConnect(fakes.clone())),
        crate::token::tests::tokens(),
        AuthzMetrics::default(),
    );
    for (name, _) in peers {
        manager
            .add_peer(
                Peer {
                    name: name.to_string(),
                    gateways: vec![Endpoint {
                        host: format!("gw.{name}"),
                        port: 443,
                    }],
                },
                reachable,
            )
            .unwrap();
    }
    manager.add_pod(PodInfo {
        id: ResourceId::new("ns-0", "client-0"),
        labels: Labels::from(btreemap! {
            "app".to_string() => "client".to_string(),
            "tier".to_string() => "frontend".to_string(),
        }),
        pod_ips: vec!["10.0.0.1".parse().unwrap()],
        host_ip: Some("192.168.0.1".parse().unwrap()),
    });

    (manager, fakes)
}

pub(crate) fn granted(token: &str) -> PeerAuthorizeResponse {
    PeerAuthorizeResponse {
        service_exists: true,
        allowed: true,
        access_token: Some(token.to_string()),
    }
}

pub(crate) fn mk_import(peers: &[&str]) -> Import {
    Import {
        id: ResourceId::new("ns-0", "svc"),
        port: 80,
        target_port: 0,
        sources: peers
            .iter()
            .map(|peer| ImportSource {
                peer: peer.to_string(),
                export_name: "svc".to_string(),
                export_namespace: "default".to_string(),
            })
            .collect(),
        lb_scheme: LbScheme::Static,
    }
}

pub(crate) fn mk_policy(id: ResourceId, from: Selector, to: Selector) -> AccessPolicy {
    AccessPolicy {
        id,
        privileged: false,
        action: PolicyAction::Allow,
        from: vec![WorkloadSetOrSelector::selector(from)],
        to: vec![WorkloadSetOrSelector::selector(to)],
    }
}

pub(crate) fn allow_all<D: Decider>(manager: &Manager<D>, ns: &str) {
    manager
        .add_policy(mk_policy(
            ResourceId::new(ns, "allow-all"),
            Selector::default(),
            Selector::default(),
        ))
        .unwrap();
}

pub(crate) fn egress() -> EgressRequest {
    EgressRequest {
        import: ResourceId::new("ns-0", "svc"),
        client_ip: "10.0.0.1".parse().unwrap(),
    }
}
