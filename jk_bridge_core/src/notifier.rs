use std::{
    collections::HashMap,
    hash::Hash,
    sync::Arc,
    time::{Duration, Instant},
};

use event_loop::{try_get, Handled, Is, MessageHandler};

use crate::{
    chat::{ChatOutbox, Outbound},
    console::classify::LogEvent,
    players::{PollSnapshot, SessionId},
    rcon::RconClient,
    restart::{
        resumed_notice, RestartSettled, RestartTimedOut, RESTART_TIMEOUT, SETTLE_DELAY,
        SUSPENDED_NOTICE, TIMED_OUT_NOTICE,
    },
    state::BridgeState,
    vpn::{self, VpnVerdict},
};

pub const DEDUP_WINDOW: Duration = Duration::from_secs(3);
pub const SYNTHETIC_COOLDOWN: Duration = Duration::from_secs(5);
pub const WELCOME_DELAY: Duration = Duration::from_secs(5);

/// Last-fired times per key. A key is ready again once `period` has passed.
#[derive(Debug)]
pub struct Cooldowns<K> {
    period: Duration,
    last: HashMap<K, Instant>,
}

impl<K: Eq + Hash> Cooldowns<K> {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: HashMap::new(),
        }
    }

    #[must_use]
    pub fn is_ready(&self, key: &K, now: Instant) -> bool {
        self.last
            .get(key)
            .map_or(true, |&at| now.saturating_duration_since(at) >= self.period)
    }

    pub fn try_acquire(&mut self, key: K, now: Instant) -> bool {
        self.acquire_all([key], now)
    }

    /// Marks every key as fired. Only true if none of them was cooling down.
    pub fn acquire_all(&mut self, keys: impl IntoIterator<Item = K>, now: Instant) -> bool {
        let keys: Vec<K> = keys.into_iter().collect();
        let ready = keys.iter().all(|k| self.is_ready(k, now));
        for key in keys {
            self.last.insert(key, now);
        }

        if self.last.len() > 256 {
            let period = self.period;
            self.last
                .retain(|_, at| now.saturating_duration_since(*at) < period);
        }
        ready
    }
}

/// Bot chat categories that share a cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Synthetic {
    Welcome,
    Duel,
    Vpn,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Signal {
    Join(SessionId),
    JoinName(String),
    Disconnect(SessionId),
    DisconnectName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Chat(Outbound),
    Rcon { command: String, delay: Duration },
    Settle { message: RestartSettled, after: Duration },
    TimeOut { message: RestartTimedOut, after: Duration },
    VpnLookup { session_id: SessionId, ip: String },
}

/// Decides which events are worth announcing. Holds only the dedup and
/// cooldown bookkeeping so it can be driven without any I/O.
#[derive(Debug)]
pub struct NotificationPolicy {
    recent: Cooldowns<Signal>,
    synthetic: Cooldowns<Synthetic>,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            recent: Cooldowns::new(DEDUP_WINDOW),
            synthetic: Cooldowns::new(SYNTHETIC_COOLDOWN),
        }
    }

    /// `state` is the state from before `event` was applied.
    pub fn plan_log_event(
        &mut self,
        state: &BridgeState,
        event: &LogEvent,
        now: Instant,
    ) -> Vec<Effect> {
        let suspended = state.restart.is_suspended();
        let settings = &state.settings;

        match event {
            LogEvent::Chat(chat) if !suspended => vec![Effect::Chat(chat.to_discord())],
            LogEvent::Join { session_id, name } if !suspended => {
                let name = name.clone().or_else(|| {
                    session_id
                        .and_then(|id| state.registry.get(id))
                        .map(|s| s.display_name.clone())
                });
                self.plan_join(state, *session_id, name, now)
            }
            LogEvent::Disconnect { session_id, name } if !suspended => {
                let name = name
                    .clone()
                    .or_else(|| state.registry.get(*session_id).map(|s| s.display_name.clone()));
                self.plan_disconnect(state, *session_id, name, now)
            }
            LogEvent::Duel { winner, loser } => {
                let Some(bot) = settings.bot_name() else {
                    return Vec::new();
                };
                if settings.rcon_target().is_none()
                    || !self.synthetic.try_acquire(Synthetic::Duel, now)
                {
                    return Vec::new();
                }
                vec![Effect::Rcon {
                    command: format!(
                        "sayasbot {bot} {winner} ^7has defeated {loser} ^7in a duel^5! :crown:"
                    ),
                    delay: Duration::ZERO,
                }]
            }
            LogEvent::Restart(_) if !suspended => vec![
                Effect::Chat(Outbound::text(SUSPENDED_NOTICE)),
                Effect::TimeOut {
                    message: RestartTimedOut {
                        epoch: state.restart.next_epoch(),
                    },
                    after: RESTART_TIMEOUT,
                },
            ],
            LogEvent::MapLoaded { .. } if state.restart.awaiting_map() => vec![Effect::Settle {
                message: RestartSettled {
                    epoch: state.restart.epoch(),
                },
                after: SETTLE_DELAY,
            }],
            LogEvent::VpnFlag { session_id, ip } => {
                if !settings.vpn_check_enabled || settings.vpn_api_key().is_none() {
                    return Vec::new();
                }
                vec![Effect::VpnLookup {
                    session_id: *session_id,
                    ip: ip.clone(),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn plan_join(
        &mut self,
        state: &BridgeState,
        session_id: Option<SessionId>,
        name: Option<String>,
        now: Instant,
    ) -> Vec<Effect> {
        let settings = &state.settings;
        if !settings.join_disconnect_enabled {
            return Vec::new();
        }
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Vec::new();
        };
        if settings.markers.is_bot(&name) {
            return Vec::new();
        }

        let mut signals = vec![Signal::JoinName(name.to_lowercase())];
        signals.extend(session_id.map(Signal::Join));
        if !self.recent.acquire_all(signals, now) {
            tracing::debug!("Suppressed repeated join for {name}");
            return Vec::new();
        }

        let mut effects = vec![Effect::Chat(Outbound::text(format!(
            "**{name}** has joined the game!"
        )))];

        if let Some(bot) = settings.bot_name() {
            if settings.rcon_target().is_some()
                && self.synthetic.try_acquire(Synthetic::Welcome, now)
            {
                effects.push(Effect::Rcon {
                    command: format!(
                        "sayasbot {bot} ^7Hey {name}^7, welcome to the server^5! :jackolantern:"
                    ),
                    delay: WELCOME_DELAY,
                });
            }
        }
        effects
    }

    fn plan_disconnect(
        &mut self,
        state: &BridgeState,
        session_id: SessionId,
        name: Option<String>,
        now: Instant,
    ) -> Vec<Effect> {
        let settings = &state.settings;
        if !settings.join_disconnect_enabled {
            return Vec::new();
        }
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Vec::new();
        };
        if settings.markers.is_bot(&name) {
            return Vec::new();
        }

        let signals = [
            Signal::Disconnect(session_id),
            Signal::DisconnectName(name.to_lowercase()),
        ];
        if !self.recent.acquire_all(signals, now) {
            tracing::debug!("Suppressed repeated disconnect for {name}");
            return Vec::new();
        }

        vec![Effect::Chat(Outbound::text(format!(
            "**{name}** has disconnected."
        )))]
    }

    /// Sessions dropped by a poll get the same notice an explicit disconnect
    /// would. Explicit disconnects already removed their session, so they
    /// never show up here.
    pub fn plan_poll(
        &mut self,
        state: &BridgeState,
        snapshot: &PollSnapshot,
        now: Instant,
    ) -> Vec<Effect> {
        if state.restart.is_suspended() {
            return Vec::new();
        }
        state
            .registry
            .departures(snapshot)
            .into_iter()
            .map(|s| (s.session_id, s.display_name.clone()))
            .collect::<Vec<_>>()
            .into_iter()
            .flat_map(|(id, name)| self.plan_disconnect(state, id, Some(name), now))
            .collect()
    }

    #[must_use]
    pub fn plan_settled(state: &BridgeState, settled: RestartSettled) -> Vec<Effect> {
        state
            .restart
            .settles(settled.epoch)
            .map(|map| vec![Effect::Chat(Outbound::text(resumed_notice(map)))])
            .unwrap_or_default()
    }

    #[must_use]
    pub fn plan_timed_out(state: &BridgeState, timed_out: RestartTimedOut) -> Vec<Effect> {
        if state.restart.times_out(timed_out.epoch) {
            vec![Effect::Chat(Outbound::text(TIMED_OUT_NOTICE))]
        } else {
            Vec::new()
        }
    }

    pub fn plan_vpn_verdict(
        &mut self,
        state: &BridgeState,
        verdict: &VpnVerdict,
        now: Instant,
    ) -> Vec<Effect> {
        if !verdict.is_vpn {
            return Vec::new();
        }
        tracing::info!("VPN detected for client {} ({})", verdict.session_id, verdict.ip);
        if state.settings.rcon_target().is_none()
            || !self.synthetic.try_acquire(Synthetic::Vpn, now)
        {
            return Vec::new();
        }
        vec![Effect::Rcon {
            command: vpn::alert(state.settings.bot_name(), &verdict.ip, verdict.session_id),
            delay: Duration::ZERO,
        }]
    }
}

// Handlers *************************

pub struct Notifier {
    policy: NotificationPolicy,
    rcon: Arc<RconClient>,
    outbox: ChatOutbox,
    http: reqwest::Client,
}

impl Notifier {
    #[must_use]
    pub fn new(rcon: Arc<RconClient>, outbox: ChatOutbox, http: reqwest::Client) -> Self {
        Self {
            policy: NotificationPolicy::new(),
            rcon,
            outbox,
            http,
        }
    }

    fn dispatch<OM>(&self, state: &BridgeState, effects: Vec<Effect>) -> Option<Handled<OM>>
    where
        OM: Is<RestartSettled> + Is<RestartTimedOut> + Is<VpnVerdict> + 'static,
    {
        let target = state.settings.rcon_target();
        let handled: Vec<Option<Handled<OM>>> = effects
            .into_iter()
            .map(|effect| match effect {
                Effect::Chat(message) => {
                    self.outbox.post(state.settings.channel_target(), message);
                    None
                }
                Effect::Rcon { command, delay } => {
                    let target = target.clone()?;
                    let rcon = self.rcon.clone();
                    Handled::future(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = rcon.send(&target, &command).await {
                            tracing::debug!("Bot message `{command}` not sent: {e}");
                        }
                        None
                    })
                }
                Effect::Settle { message, after } => Handled::future(async move {
                    tokio::time::sleep(after).await;
                    Some(message.into())
                }),
                Effect::TimeOut { message, after } => Handled::future(async move {
                    tokio::time::sleep(after).await;
                    Some(message.into())
                }),
                Effect::VpnLookup { session_id, ip } => {
                    let api_key = state.settings.vpn_api_key()?.to_owned();
                    let http = self.http.clone();
                    Handled::future(async move {
                        match vpn::is_vpn(&http, &ip, &api_key).await {
                            Ok(is_vpn) => Some(
                                VpnVerdict {
                                    session_id,
                                    ip,
                                    is_vpn,
                                }
                                .into(),
                            ),
                            Err(e) => {
                                tracing::debug!("VPN lookup for {ip} failed: {e}");
                                None
                            }
                        }
                    })
                }
            })
            .collect();
        Handled::multiple(handled)
    }
}

impl<IM, OM> MessageHandler<BridgeState, IM, OM> for Notifier
where
    IM: Is<LogEvent> + Is<PollSnapshot> + Is<RestartSettled> + Is<RestartTimedOut> + Is<VpnVerdict>,
    OM: Is<RestartSettled> + Is<RestartTimedOut> + Is<VpnVerdict> + 'static,
{
    fn handle_message(&mut self, state: &BridgeState, message: &IM) -> Option<Handled<OM>> {
        let now = Instant::now();
        let effects = if let Some(event) = try_get::<LogEvent>(message) {
            self.policy.plan_log_event(state, event, now)
        } else if let Some(snapshot) = try_get::<PollSnapshot>(message) {
            self.policy.plan_poll(state, snapshot, now)
        } else if let Some(settled) = try_get::<RestartSettled>(message) {
            NotificationPolicy::plan_settled(state, *settled)
        } else if let Some(timed_out) = try_get::<RestartTimedOut>(message) {
            NotificationPolicy::plan_timed_out(state, *timed_out)
        } else if let Some(verdict) = try_get::<VpnVerdict>(message) {
            self.policy.plan_vpn_verdict(state, verdict, now)
        } else {
            return Handled::none();
        };

        if effects.is_empty() {
            return Handled::none();
        }
        self.dispatch(state, effects)
    }
}
