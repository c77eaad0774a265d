//! Turns flood and group-policy verdicts into request outcomes.
//!
//! Only the outcome is decided here. Hit logs and kernel blocklist inserts go
//! through the [`TaskDispatcher`], so the response never waits on them. The
//! HTTP layer renders the [`Enforcement`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::firewall::{
    challenge_client_id, CcLog, CcPolicy, GroupHitLog, HitInfo, HitKind, PolicyAction, PolicyHit, RequestSummary,
    RequestView,
};
use crate::observability::metrics;
use crate::routing::IpMethod;
use crate::security::challenge::ChallengeStore;
use crate::security::dispatch::{BackgroundTask, TaskDispatcher};

/// Name shown for flood blocks.
pub const FLOOD_VULN_NAME: &str = "CC";
/// Name stored with group-policy challenges.
pub const GROUP_CHALLENGE_NAME: &str = "Group Policy Hit";

#[derive(Debug, Clone)]
pub enum Verdict {
    Flood {
        policy: Arc<CcPolicy>,
        client_id: String,
        need_log: bool,
    },
    Group(PolicyHit),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enforcement {
    Continue,
    Block { policy_id: i64, vuln_name: String },
    /// 307 to the challenge page.
    Challenge { location: String },
}

/// The request a verdict was reached for.
#[derive(Debug, Clone, Copy)]
pub struct HitContext<'a> {
    pub view: &'a RequestView<'a>,
    pub app_id: i64,
    pub ip_method: IpMethod,
    pub src_ip: &'a str,
    pub now: i64,
}

pub struct Enforcer {
    dispatcher: TaskDispatcher,
    challenges: Arc<ChallengeStore>,
    challenge_path: String,
}

impl Enforcer {
    pub fn new(dispatcher: TaskDispatcher, challenges: Arc<ChallengeStore>, challenge_path: impl Into<String>) -> Self {
        Self {
            dispatcher,
            challenges,
            challenge_path: challenge_path.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn challenges(&self) -> &Arc<ChallengeStore> {
        &self.challenges
    }

    pub fn challenge_path(&self) -> &str {
        &self.challenge_path
    }

    pub fn enforce(&self, verdict: Verdict, ctx: &HitContext<'_>) -> Enforcement {
        match verdict {
            Verdict::Flood { policy, client_id, need_log } => self.enforce_flood(&policy, client_id, need_log, ctx),
            Verdict::Group(hit) => self.enforce_group(hit, ctx),
        }
    }

    fn enforce_flood(&self, policy: &CcPolicy, client_id: String, need_log: bool, ctx: &HitContext<'_>) -> Enforcement {
        metrics::record_waf_hit("flood", policy.action.as_str());
        if need_log && policy.action != PolicyAction::Pass {
            self.dispatcher.dispatch(BackgroundTask::FloodHit(CcLog {
                request: RequestSummary::capture(ctx.view, ctx.src_ip, ctx.now),
                app_id: ctx.app_id,
                action: policy.action,
            }));
        }

        match policy.action {
            PolicyAction::Block => {
                tracing::info!(app_id = ctx.app_id, src_ip = %ctx.src_ip, policy_id = policy.app_id, "CC attack blocked");
                if need_log && ctx.ip_method == IpMethod::RemoteAddr {
                    self.block_address(ctx.src_ip, Duration::from_secs(policy.block_seconds));
                }
                Enforcement::Block {
                    policy_id: policy.app_id,
                    vuln_name: FLOOD_VULN_NAME.to_string(),
                }
            }
            PolicyAction::BypassAndLog | PolicyAction::Pass => Enforcement::Continue,
            PolicyAction::Challenge => self.challenge(
                HitInfo {
                    kind: HitKind::Flood,
                    policy_id: policy.app_id,
                    vuln_name: FLOOD_VULN_NAME.to_string(),
                    action: policy.action,
                    client_id,
                    target_url: ctx.view.target_url(),
                    block_time: ctx.now,
                },
                ctx.app_id,
            ),
        }
    }

    fn enforce_group(&self, hit: PolicyHit, ctx: &HitContext<'_>) -> Enforcement {
        let group = &hit.group;
        metrics::record_waf_hit("group", group.action.as_str());
        if group.action == PolicyAction::Pass {
            return Enforcement::Continue;
        }

        self.dispatcher.dispatch(BackgroundTask::GroupHit(GroupHitLog {
            request: RequestSummary::capture(ctx.view, ctx.src_ip, ctx.now),
            app_id: ctx.app_id,
            policy_id: group.id,
            vuln_id: group.vuln_id,
            action: group.action,
        }));

        match group.action {
            PolicyAction::Block => {
                tracing::info!(
                    app_id = ctx.app_id,
                    src_ip = %ctx.src_ip,
                    policy_id = group.id,
                    check_item_id = hit.check_item_id,
                    vuln = %hit.vuln_name,
                    "Group policy blocked request"
                );
                Enforcement::Block {
                    policy_id: group.id,
                    vuln_name: hit.vuln_name,
                }
            }
            PolicyAction::Challenge => self.challenge(
                HitInfo {
                    kind: HitKind::Group,
                    policy_id: group.id,
                    vuln_name: GROUP_CHALLENGE_NAME.to_string(),
                    action: group.action,
                    client_id: challenge_client_id(ctx.src_ip, ctx.view),
                    target_url: ctx.view.target_url(),
                    block_time: ctx.now,
                },
                ctx.app_id,
            ),
            PolicyAction::BypassAndLog | PolicyAction::Pass => Enforcement::Continue,
        }
    }

    fn challenge(&self, hit: HitInfo, app_id: i64) -> Enforcement {
        if hit.kind == HitKind::Group && self.challenges.consume_pass(&hit.client_id) {
            tracing::debug!(app_id, policy_id = hit.policy_id, "Challenge pass used");
            return Enforcement::Continue;
        }
        let id = self.challenges.issue(hit, app_id);
        Enforcement::Challenge {
            location: format!("{}/confirm?id={}", self.challenge_path, id),
        }
    }

    fn block_address(&self, src_ip: &str, ttl: Duration) {
        match src_ip.parse::<IpAddr>() {
            Ok(ip) => {
                self.dispatcher.dispatch(BackgroundTask::BlockAddress { ip, ttl });
            }
            Err(_) => tracing::debug!(src_ip = %src_ip, "Source is not an IP address, kernel block skipped"),
        }
    }
}

impl std::fmt::Debug for Enforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enforcer")
            .field("challenge_path", &self.challenge_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use tokio::sync::mpsc;

    use crate::firewall::GroupPolicy;
    use crate::security::challenge::{ArithmeticChallenge, ChallengeOutcome};

    fn enforcer(capacity: usize) -> (Enforcer, mpsc::Receiver<BackgroundTask>) {
        let (dispatcher, rx) = TaskDispatcher::channel(capacity);
        let challenges = Arc::new(ChallengeStore::new(Duration::from_secs(300), Box::new(ArithmeticChallenge)));
        (Enforcer::new(dispatcher, challenges, "/captcha/"), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<BackgroundTask>) -> Vec<BackgroundTask> {
        let mut tasks = Vec::new();
        while let Ok(task) = rx.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    fn flood(action: PolicyAction, need_log: bool) -> Verdict {
        Verdict::Flood {
            policy: Arc::new(CcPolicy { action, ..CcPolicy::global() }),
            client_id: "fp".into(),
            need_log,
        }
    }

    fn group(action: PolicyAction) -> Verdict {
        Verdict::Group(PolicyHit {
            group: Arc::new(GroupPolicy {
                id: 12,
                name: "sqli".into(),
                description: String::new(),
                app_id: 0,
                vuln_id: 1,
                action,
                is_enabled: true,
                check_items: Vec::new(),
                updated_time: 0,
            }),
            vuln_name: "SQL Injection".into(),
            check_item_id: 3,
        })
    }

    fn ctx<'a>(view: &'a RequestView<'a>, ip_method: IpMethod) -> HitContext<'a> {
        HitContext { view, app_id: 4, ip_method, src_ip: "203.0.113.9", now: 1_700_000_000 }
    }

    #[tokio::test]
    async fn test_flood_block_logs_once_and_blocks_address() {
        let (enforcer, mut rx) = enforcer(16);
        let headers = HeaderMap::new();
        let view = RequestView { host: "h", method: "GET", path: "/", query: "", headers: &headers };

        let outcome = enforcer.enforce(flood(PolicyAction::Block, true), &ctx(&view, IpMethod::RemoteAddr));
        assert_eq!(outcome, Enforcement::Block { policy_id: 0, vuln_name: "CC".into() });
        let tasks = drain(&mut rx);
        assert_eq!(tasks.len(), 2);
        assert!(matches!(tasks[0], BackgroundTask::FloodHit(ref log) if log.app_id == 4));
        assert!(matches!(tasks[1], BackgroundTask::BlockAddress { ttl, .. } if ttl == Duration::from_secs(7200)));

        enforcer.enforce(flood(PolicyAction::Block, false), &ctx(&view, IpMethod::RemoteAddr));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_forwarded_ip_never_reaches_kernel() {
        let (enforcer, mut rx) = enforcer(16);
        let headers = HeaderMap::new();
        let view = RequestView { host: "h", method: "GET", path: "/", query: "", headers: &headers };

        enforcer.enforce(flood(PolicyAction::Block, true), &ctx(&view, IpMethod::XForwardedFor));
        let tasks = drain(&mut rx);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind(), "cc_log");
    }

    #[tokio::test]
    async fn test_group_bypass_logs_and_continues() {
        let (enforcer, mut rx) = enforcer(16);
        let headers = HeaderMap::new();
        let view = RequestView { host: "h", method: "GET", path: "/", query: "id=1", headers: &headers };

        let outcome = enforcer.enforce(group(PolicyAction::BypassAndLog), &ctx(&view, IpMethod::RemoteAddr));
        assert_eq!(outcome, Enforcement::Continue);
        let tasks = drain(&mut rx);
        assert!(matches!(&tasks[..], [BackgroundTask::GroupHit(log)] if log.policy_id == 12 && log.vuln_id == 1));

        assert_eq!(enforcer.enforce(group(PolicyAction::Pass), &ctx(&view, IpMethod::RemoteAddr)), Enforcement::Continue);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_group_block_names_vulnerability() {
        let (enforcer, _rx) = enforcer(16);
        let headers = HeaderMap::new();
        let view = RequestView { host: "h", method: "GET", path: "/", query: "", headers: &headers };

        let outcome = enforcer.enforce(group(PolicyAction::Block), &ctx(&view, IpMethod::RemoteAddr));
        assert_eq!(outcome, Enforcement::Block { policy_id: 12, vuln_name: "SQL Injection".into() });
    }

    #[tokio::test]
    async fn test_challenge_redirects_then_solved_request_passes_once() {
        let (enforcer, _rx) = enforcer(16);
        let headers = HeaderMap::new();
        let view = RequestView { host: "h", method: "GET", path: "/admin", query: "x=1", headers: &headers };
        let ctx = ctx(&view, IpMethod::RemoteAddr);

        let location = match enforcer.enforce(group(PolicyAction::Challenge), &ctx) {
            Enforcement::Challenge { location } => location,
            other => panic!("unexpected {other:?}"),
        };
        let id = challenge_client_id(ctx.src_ip, &view);
        assert_eq!(location, format!("/captcha/confirm?id={id}"));

        let prompt = enforcer.challenges().question(&id).unwrap();
        let (lhs, _) = prompt.split_once(" = ").unwrap();
        let (a, b) = lhs.split_once(" + ").unwrap();
        let answer = (a.parse::<u32>().unwrap() + b.parse::<u32>().unwrap()).to_string();
        match enforcer.challenges().verify(&id, &answer) {
            ChallengeOutcome::Solved(record) => {
                assert_eq!(record.hit.vuln_name, GROUP_CHALLENGE_NAME);
                assert_eq!(record.hit.target_url, "/admin?x=1");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(enforcer.enforce(group(PolicyAction::Challenge), &ctx), Enforcement::Continue);
        assert!(matches!(
            enforcer.enforce(group(PolicyAction::Challenge), &ctx),
            Enforcement::Challenge { .. }
        ));
    }
}
