use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use card_lounge_core::{
    GameStateInfo, MAX_FRAME_LEN, Message, PlayerIndex, ResponseKind, Sequence, TypedMessage, UpdateGameStateRequest,
};
use tracing::{debug, error, info, warn};

use crate::config::{BroadcastPolicy, ServerConfig};
use crate::correlation::{PendingResponse, PendingResponses, ResponseContext};
use crate::error::PendingResponseError;
use crate::registry::{ConnectionId, SessionRegistry};
use crate::rules::{GameRules, TableRules};

/// 对局进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// 还没有调用 `start()`
    Start,
    WaitingForParticipants,
    WaitingForAction,
    /// 终止状态，目前没有进入它的条件
    Ended,
}

/// 事件循环要写回某个连接的一条消息（已经是信封 JSON，尚未分帧）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub conn: ConnectionId,
    pub payload: String,
}

/// 一场对局的全部状态。只由事件循环所在的任务持有和修改，不需要加锁。
pub struct Session {
    roster: Vec<String>,
    pub(crate) phase: SessionPhase,
    next_sequence: Sequence,
    pub(crate) registry: SessionRegistry,
    pub(crate) pending: PendingResponses,
    pub(crate) game_state: GameStateInfo,
    pub(crate) rules: Box<dyn GameRules>,
    broadcast_policy: BroadcastPolicy,
    response_timeout: Duration,
    // 上次推送之后，握手或动作是否修改过状态
    pub(crate) dirty: bool,
}

impl Session {
    pub fn new(config: &ServerConfig) -> Self {
        let turn_timer_ms = i64::try_from(config.turn_timer.as_millis()).unwrap_or(i64::MAX);
        Self::with_rules(config, Box::new(TableRules::new(config.hand_size, turn_timer_ms)))
    }

    pub fn with_rules(config: &ServerConfig, rules: Box<dyn GameRules>) -> Self {
        let roster = dedup_roster(&config.profile_ids);
        Session {
            game_state: GameStateInfo::new(roster.len(), config.init_net_worth),
            roster,
            phase: SessionPhase::Start,
            next_sequence: 0,
            registry: SessionRegistry::new(),
            pending: PendingResponses::new(),
            rules,
            broadcast_policy: config.broadcast_policy,
            response_timeout: config.response_timeout,
            dirty: false,
        }
    }

    pub fn start(&mut self) {
        info!("对局开始，等待 {} 位玩家加入", self.roster.len());
        self.phase = SessionPhase::WaitingForParticipants;
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }

    pub fn game_state(&self) -> &GameStateInfo {
        &self.game_state
    }

    /// 身份在名单中的下标
    pub(crate) fn roster_index(&self, profile_id: &str) -> Option<PlayerIndex> {
        self.roster.iter().position(|p| p == profile_id).map(|i| i as PlayerIndex)
    }

    pub(crate) fn player_of(&self, conn: ConnectionId) -> Option<PlayerIndex> {
        self.registry.profile_of(conn).and_then(|p| self.roster_index(p))
    }

    /// 连接断开（或被拆除）：解除绑定，并让它名下所有等待中的响应失败
    pub fn connection_closed(&mut self, conn: ConnectionId) {
        if let Some(profile_id) = self.registry.unbind(conn) {
            info!("玩家 {} 的连接 {} 已断开", profile_id, conn);
        }
        for (sequence, pending) in self.pending.drain_connection(conn) {
            self.fail_pending(sequence, pending, PendingResponseError::ConnectionLost);
        }
    }

    /// 清理所有已超时的等待记录
    pub fn reap_expired(&mut self, now: Instant) {
        for (sequence, pending) in self.pending.drain_expired(now) {
            self.fail_pending(sequence, pending, PendingResponseError::ResponseTimeout);
        }
    }

    fn fail_pending(&mut self, sequence: Sequence, pending: PendingResponse, err: PendingResponseError) {
        self.on_response(sequence, pending, Err(err));
    }

    /// 每处理完一个客户端请求后调用，推动状态机
    pub(crate) fn on_request_done(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        match self.phase {
            SessionPhase::WaitingForParticipants => {
                if self.registry.all_present(&self.roster) {
                    info!("所有玩家已到齐，开始等待玩家行动");
                    self.phase = SessionPhase::WaitingForAction;
                    self.rules.begin_round(&mut self.game_state, unix_millis());
                    self.broadcast_state(now, out);
                }
            }
            SessionPhase::WaitingForAction => {
                let should_broadcast = match self.broadcast_policy {
                    BroadcastPolicy::EveryRequest => true,
                    BroadcastPolicy::OnChange => self.dirty,
                };
                if should_broadcast {
                    self.broadcast_state(now, out);
                }
            }
            SessionPhase::Start | SessionPhase::Ended => {}
        }
    }

    /// 给每个已绑定的连接推送一份过滤后的游戏状态
    pub(crate) fn broadcast_state(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        let server_timestamp_ms = unix_millis();
        let mut recipients: Vec<(ConnectionId, String)> =
            self.registry.iter().map(|(conn, p)| (conn, p.to_string())).collect();
        recipients.sort();

        for (conn, profile_id) in recipients {
            let Some(player) = self.roster_index(&profile_id) else {
                warn!("推送状态时找不到身份 {}", profile_id);
                continue;
            };

            let sequence = self.next_sequence;
            self.next_sequence += 1;

            let view = self.game_state.for_player(player);
            let game_state_info_delta = match serde_json::to_string(&view) {
                Ok(s) => s,
                Err(e) => {
                    error!("序列化游戏状态失败: {}", e);
                    continue;
                }
            };
            let request = UpdateGameStateRequest {
                server_timestamp_ms,
                game_state_info_delta,
                available_actions: self.rules.available_actions(&self.game_state, player),
            };
            let payload = match request.into_request(sequence).and_then(|r| Message::Request(r).to_raw()) {
                Ok(p) => p,
                Err(e) => {
                    error!("构造状态推送失败: {}", e);
                    continue;
                }
            };
            // 发不出去的推送不能登记等待，否则只能等超时才被清理
            if payload.len() > MAX_FRAME_LEN {
                error!("推送给玩家 {} 的状态有 {} 字节，超出单帧上限，已跳过", player, payload.len());
                continue;
            }

            self.pending.register(
                sequence,
                PendingResponse {
                    kind: ResponseKind::UpdateGameState,
                    context: ResponseContext::StateUpdate { player },
                    conn,
                    deadline: now + self.response_timeout,
                },
            );
            debug!("向玩家 {} ({}) 推送状态, seq = {}", player, conn, sequence);
            out.push(Outbound { conn, payload });
        }
        self.dirty = false;
    }
}

/// 去掉重复的身份，保留第一次出现的位置
fn dedup_roster(profile_ids: &[String]) -> Vec<String> {
    let mut roster: Vec<String> = Vec::with_capacity(profile_ids.len());
    for id in profile_ids {
        if roster.contains(id) {
            warn!("玩家名单中重复的身份 {} 已忽略", id);
        } else {
            roster.push(id.clone());
        }
    }
    roster
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
