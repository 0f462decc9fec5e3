//! 消息分发：客户端请求按类型交给对应的处理函数，客户端响应按序号找回当初的请求。
//!
//! 协议层面的错误（无法解析、未知类型、未知序号）只记录日志，不会断开连接。

use std::time::Instant;

use card_lounge_core::{
    ClientRequest, DoActionRequest, DoActionResponse, HandshakeRequest, HandshakeResponse, MAX_NAME_LEN, Message,
    Request, Response, ResponseKind, Sequence, TypedMessage, UpdateGameStateResponse,
};
use tracing::{debug, error, info, warn};

use crate::correlation::{PendingResponse, ResponseContext, Unresolved};
use crate::error::{ActionError, PendingResponseError};
use crate::registry::ConnectionId;
use crate::session::{Outbound, Session, SessionPhase, unix_millis};

impl Session {
    /// 处理一个完整的帧负载，返回需要写回的消息（按发送顺序）
    pub fn handle_frame(&mut self, conn: ConnectionId, raw: &str, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        match Message::parse(raw) {
            Ok(Message::Request(request)) => self.handle_request(conn, request, now, &mut out),
            Ok(Message::Response(response)) => self.handle_response(conn, response),
            Err(e) => warn!("连接 {} 的消息无法解析，已丢弃: {}", conn, e),
        }
        out
    }

    fn handle_request(&mut self, conn: ConnectionId, request: Request, now: Instant, out: &mut Vec<Outbound>) {
        debug!("处理连接 {} 的请求 seq = {}, type = {}", conn, request.sequence, request.type_tag);

        let response_data = match ClientRequest::parse(&request.type_tag, &request.payload) {
            Ok(Some(ClientRequest::Handshake(req))) => self.handle_handshake(conn, req).to_payload(),
            Ok(Some(ClientRequest::DoAction(req))) => self.handle_do_action(conn, req).to_payload(),
            Ok(None) => {
                warn!("连接 {} 发来未知的请求类型 {}", conn, request.type_tag);
                Ok(String::new())
            }
            Err(e) => {
                warn!("连接 {} 的请求负载无法解析: {}", conn, e);
                Ok(String::new())
            }
        };
        let payload = response_data.unwrap_or_else(|e| {
            error!("序列化响应失败: {}", e);
            String::new()
        });

        // 无论请求是否被识别，都用同一个序号回一个响应
        let reply = Message::Response(Response { sequence: request.sequence, payload });
        match reply.to_raw() {
            Ok(payload) => out.push(Outbound { conn, payload }),
            Err(e) => error!("序列化响应信封失败: {}", e),
        }

        self.on_request_done(now, out);
    }

    fn handle_response(&mut self, conn: ConnectionId, response: Response) {
        debug!("处理连接 {} 的响应 seq = {}", conn, response.sequence);
        match self.pending.resolve(response.sequence, conn) {
            Ok(pending) => self.on_response(response.sequence, pending, Ok(&response.payload)),
            Err(Unresolved::UnknownSequence) => {
                warn!("连接 {} 的响应序号 {} 没有对应的请求，已丢弃", conn, response.sequence);
            }
            Err(Unresolved::WrongConnection { expected }) => {
                warn!(
                    "响应序号 {} 应来自连接 {}，却来自 {}，已丢弃",
                    response.sequence, expected, conn
                );
            }
        }
    }

    /// 把响应（或失败原因）交给发出请求时登记的处理函数
    pub(crate) fn on_response(
        &mut self,
        sequence: Sequence,
        pending: PendingResponse,
        result: Result<&str, PendingResponseError>,
    ) {
        match pending.kind {
            ResponseKind::UpdateGameState => {
                self.handle_update_game_state_response(sequence, pending.conn, pending.context, result)
            }
        }
    }

    // --- 请求处理函数 ---

    fn handle_handshake(&mut self, conn: ConnectionId, request: HandshakeRequest) -> HandshakeResponse {
        let Some(player) = self.roster_index(&request.profile_id) else {
            warn!("连接 {} 使用了未知的身份 {}", conn, request.profile_id);
            return HandshakeResponse { success: false };
        };
        if request.name.len() > MAX_NAME_LEN {
            warn!("连接 {} 的显示名过长 ({} 字节)，拒绝握手", conn, request.name.len());
            return HandshakeResponse { success: false };
        }

        if let Some(stale) = self.registry.bind(conn, &request.profile_id) {
            info!("身份 {} 在新连接 {} 上登录，旧连接 {} 的绑定已解除", request.profile_id, conn, stale);
        }
        if let Some(info) = self.game_state.player_mut(player) {
            info.name = request.name;
        }
        self.dirty = true;
        info!("连接 {} 握手成功，身份 {}，玩家编号 {}", conn, request.profile_id, player);
        HandshakeResponse { success: true }
    }

    fn handle_do_action(&mut self, conn: ConnectionId, request: DoActionRequest) -> DoActionResponse {
        match self.try_do_action(conn, &request) {
            Ok(()) => {
                self.dirty = true;
                DoActionResponse { success: true }
            }
            Err(e) => {
                warn!("连接 {} 的动作 {} 被拒绝: {}", conn, request.action, e);
                DoActionResponse { success: false }
            }
        }
    }

    fn try_do_action(&mut self, conn: ConnectionId, request: &DoActionRequest) -> Result<(), ActionError> {
        if self.phase != SessionPhase::WaitingForAction {
            return Err(ActionError::WrongPhase);
        }
        let player = self.player_of(conn).ok_or(ActionError::NotSeated)?;
        self.rules.apply_action(&mut self.game_state, player, request, unix_millis())
    }

    // --- 响应处理函数 ---

    fn handle_update_game_state_response(
        &mut self,
        sequence: Sequence,
        conn: ConnectionId,
        context: ResponseContext,
        result: Result<&str, PendingResponseError>,
    ) {
        let ResponseContext::StateUpdate { player } = context;
        match result.map(UpdateGameStateResponse::from_payload) {
            Ok(Ok(UpdateGameStateResponse { success: true })) => {
                debug!("玩家 {} 已确认状态推送 seq = {}", player, sequence);
            }
            Ok(Ok(UpdateGameStateResponse { success: false })) => {
                warn!("玩家 {} 未能应用状态推送 seq = {}", player, sequence);
            }
            Ok(Err(e)) => warn!("玩家 {} 对状态推送 seq = {} 的响应无法解析: {}", player, sequence, e),
            Err(e) => warn!("推送给玩家 {} ({}) 的状态 seq = {} 失败: {}", player, conn, sequence, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BroadcastPolicy, ServerConfig};
    use card_lounge_core::{GameStateInfo, UpdateGameStateRequest};
    use std::time::Duration;

    fn session(roster: &[&str]) -> Session {
        session_with(roster, BroadcastPolicy::EveryRequest)
    }

    fn session_with(roster: &[&str], broadcast_policy: BroadcastPolicy) -> Session {
        let config = ServerConfig {
            profile_ids: roster.iter().map(|s| s.to_string()).collect(),
            broadcast_policy,
            ..ServerConfig::default()
        };
        let mut session = Session::new(&config);
        session.start();
        session
    }

    fn request_raw(sequence: Sequence, message: impl TypedMessage) -> String {
        Message::Request(message.into_request(sequence).unwrap()).to_raw().unwrap()
    }

    fn handshake(profile_id: &str, name: &str) -> HandshakeRequest {
        HandshakeRequest { profile_id: profile_id.into(), name: name.into() }
    }

    fn parse(out: &[Outbound]) -> Vec<(ConnectionId, Message)> {
        out.iter().map(|o| (o.conn, Message::parse(&o.payload).unwrap())).collect()
    }

    fn expect_response(message: &Message) -> &Response {
        match message {
            Message::Response(r) => r,
            other => panic!("expected response, got {other:?}"),
        }
    }

    /// 取出状态推送中的请求序号和过滤后的状态
    fn expect_state_update(message: &Message) -> (Sequence, GameStateInfo, Vec<String>) {
        match message {
            Message::Request(r) => {
                assert_eq!(r.type_tag, "Networking.UpdateGameStateRequest");
                let update = UpdateGameStateRequest::from_payload(&r.payload).unwrap();
                let state = serde_json::from_str(&update.game_state_info_delta).unwrap();
                (r.sequence, state, update.available_actions)
            }
            other => panic!("expected state update request, got {other:?}"),
        }
    }

    #[test]
    fn test_single_player_handshake_then_broadcast() {
        let mut session = session(&["aaa"]);
        let conn = ConnectionId::new();

        let out = parse(&session.handle_frame(conn, &request_raw(11, handshake("aaa", "Alice")), Instant::now()));
        assert_eq!(out.len(), 2);

        let reply = expect_response(&out[0].1);
        assert_eq!(reply.sequence, 11);
        assert_eq!(HandshakeResponse::from_payload(&reply.payload).unwrap(), HandshakeResponse { success: true });

        assert_eq!(out[1].0, conn);
        let (sequence, state, actions) = expect_state_update(&out[1].1);
        assert_eq!(sequence, 0);
        assert_eq!(state.player_id, 0);
        assert_eq!(state.player_infos[0].name, "Alice");
        assert_eq!(state.player_infos[0].main_hand.len(), 2);
        assert_eq!(actions, vec!["FollowBet", "RaiseBet", "Fold"]);
        assert_eq!(session.phase(), SessionPhase::WaitingForAction);
        assert!(session.pending().contains(0));
    }

    #[test]
    fn test_unknown_identity_is_rejected() {
        let mut session = session(&["aaa", "bbb"]);
        let conn = ConnectionId::new();

        let out = parse(&session.handle_frame(conn, &request_raw(1, handshake("zzz", "Mallory")), Instant::now()));
        assert_eq!(out.len(), 1);
        let reply = expect_response(&out[0].1);
        assert_eq!(HandshakeResponse::from_payload(&reply.payload).unwrap(), HandshakeResponse { success: false });
        assert!(session.registry().is_empty());
        assert!(session.game_state().player_infos.iter().all(|p| p.name.is_empty()));
        assert_eq!(session.phase(), SessionPhase::WaitingForParticipants);
    }

    #[test]
    fn test_second_connection_takes_over_identity() {
        let mut session = session(&["aaa", "bbb"]);
        let (first, second) = (ConnectionId::new(), ConnectionId::new());

        session.handle_frame(first, &request_raw(1, handshake("aaa", "Alice")), Instant::now());
        session.handle_frame(second, &request_raw(1, handshake("aaa", "Alice 2")), Instant::now());

        assert_eq!(session.registry().profile_of(first), None);
        assert_eq!(session.registry().profile_of(second), Some("aaa"));
        assert_eq!(session.game_state().player_infos[0].name, "Alice 2");

        // 旧连接仍然可以继续发请求
        let out = parse(&session.handle_frame(first, &request_raw(2, handshake("zzz", "")), Instant::now()));
        assert_eq!(expect_response(&out[0].1).sequence, 2);
    }

    #[test]
    fn test_all_participants_present_triggers_one_broadcast_each() {
        let mut session = session(&["aaa", "bbb"]);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());

        let out = session.handle_frame(a, &request_raw(1, handshake("aaa", "Alice")), Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(session.phase(), SessionPhase::WaitingForParticipants);

        let out = parse(&session.handle_frame(b, &request_raw(1, handshake("bbb", "Bob")), Instant::now()));
        assert_eq!(session.phase(), SessionPhase::WaitingForAction);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].0, b);
        expect_response(&out[0].1);

        let mut seen = Vec::new();
        for (conn, message) in &out[1..] {
            let (_, state, _) = expect_state_update(message);
            let me = if *conn == a { 0 } else { 1 };
            assert_eq!(state.player_id, me);
            assert_eq!(state.player_infos[0].name, "Alice");
            assert_eq!(state.player_infos[1].name, "Bob");
            for (i, info) in state.player_infos.iter().enumerate() {
                assert_eq!(info.main_hand.is_empty(), i as i32 != me, "hand visibility for player {i}");
            }
            seen.push(*conn);
        }
        seen.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(session.pending().len(), 2);
    }

    #[test]
    fn test_unknown_request_type_gets_empty_reply() {
        let mut session = session(&["aaa", "bbb"]);
        let conn = ConnectionId::new();
        let raw = Message::Request(Request {
            sequence: 42,
            type_tag: "Networking.TeleportRequest".into(),
            payload: "{}".into(),
        })
        .to_raw()
        .unwrap();

        let out = parse(&session.handle_frame(conn, &raw, Instant::now()));
        assert_eq!(out.len(), 1);
        let reply = expect_response(&out[0].1);
        assert_eq!(reply.sequence, 42);
        assert_eq!(reply.payload, "");

        // 连接仍然可用
        let out = parse(&session.handle_frame(conn, &request_raw(43, handshake("aaa", "Alice")), Instant::now()));
        let reply = expect_response(&out[0].1);
        assert_eq!(reply.sequence, 43);
        assert_eq!(HandshakeResponse::from_payload(&reply.payload).unwrap().success, true);
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let mut session = session(&["aaa"]);
        let conn = ConnectionId::new();
        assert!(session.handle_frame(conn, "not json at all", Instant::now()).is_empty());
        assert!(session.handle_frame(conn, r#"{"type":1,"data":"nope"}"#, Instant::now()).is_empty());

        // 负载损坏的已知请求仍然会得到空响应
        let raw = Message::Request(Request {
            sequence: 5,
            type_tag: HandshakeRequest::TYPE_TAG.into(),
            payload: "{broken".into(),
        })
        .to_raw()
        .unwrap();
        let out = parse(&session.handle_frame(conn, &raw, Instant::now()));
        assert_eq!(expect_response(&out[0].1).payload, "");
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_unresolved_response_is_dropped() {
        let mut session = session(&["aaa"]);
        let conn = ConnectionId::new();
        session.handle_frame(conn, &request_raw(1, handshake("aaa", "Alice")), Instant::now());
        assert_eq!(session.pending().len(), 1);

        let stray = Message::Response(UpdateGameStateResponse { success: true }.into_response(99).unwrap())
            .to_raw()
            .unwrap();
        assert!(session.handle_frame(conn, &stray, Instant::now()).is_empty());
        assert_eq!(session.pending().len(), 1);
    }

    #[test]
    fn test_acknowledgement_resolves_pending_entry() {
        let mut session = session(&["aaa"]);
        let (conn, other) = (ConnectionId::new(), ConnectionId::new());
        session.handle_frame(conn, &request_raw(1, handshake("aaa", "Alice")), Instant::now());

        let ack = Message::Response(UpdateGameStateResponse { success: true }.into_response(0).unwrap())
            .to_raw()
            .unwrap();
        // 来自别的连接的响应不算数
        assert!(session.handle_frame(other, &ack, Instant::now()).is_empty());
        assert!(session.pending().contains(0));

        assert!(session.handle_frame(conn, &ack, Instant::now()).is_empty());
        assert!(session.pending().is_empty());
    }

    #[test]
    fn test_pending_entries_reclaimed_on_close_and_timeout() {
        let mut session = session(&["aaa", "bbb"]);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let now = Instant::now();
        session.handle_frame(a, &request_raw(1, handshake("aaa", "Alice")), now);
        session.handle_frame(b, &request_raw(1, handshake("bbb", "Bob")), now);
        assert_eq!(session.pending().len(), 2);

        session.connection_closed(a);
        assert_eq!(session.pending().len(), 1);
        assert_eq!(session.registry().profile_of(a), None);

        session.reap_expired(now + Duration::from_secs(1));
        assert_eq!(session.pending().len(), 1);
        session.reap_expired(now + ServerConfig::default().response_timeout);
        assert!(session.pending().is_empty());
    }

    #[test]
    fn test_sequence_counter_is_monotonic() {
        let mut session = session(&["aaa"]);
        let conn = ConnectionId::new();
        let mut sequences = Vec::new();
        for seq in 0..3 {
            let out = parse(&session.handle_frame(conn, &request_raw(seq, handshake("aaa", "Alice")), Instant::now()));
            sequences.push(expect_state_update(&out[1].1).0);
        }
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_actions_before_everyone_arrives_are_rejected() {
        let mut session = session(&["aaa", "bbb"]);
        let conn = ConnectionId::new();
        session.handle_frame(conn, &request_raw(1, handshake("aaa", "Alice")), Instant::now());

        let action = DoActionRequest { action: "Fold".into(), data: String::new() };
        let out = parse(&session.handle_frame(conn, &request_raw(2, action), Instant::now()));
        let reply = expect_response(&out[0].1);
        assert_eq!(DoActionResponse::from_payload(&reply.payload).unwrap(), DoActionResponse { success: false });
    }

    #[test]
    fn test_actions_from_unbound_connection_are_rejected() {
        let mut session = session(&["aaa"]);
        session.handle_frame(ConnectionId::new(), &request_raw(1, handshake("aaa", "Alice")), Instant::now());

        let stranger = ConnectionId::new();
        let action = DoActionRequest { action: "Fold".into(), data: String::new() };
        let out = parse(&session.handle_frame(stranger, &request_raw(2, action), Instant::now()));
        let reply = expect_response(&out[0].1);
        assert_eq!(DoActionResponse::from_payload(&reply.payload).unwrap().success, false);
        assert!(!session.game_state().player_infos[0].is_folded);
    }

    #[test]
    fn test_on_change_policy_only_broadcasts_after_mutation() {
        let mut session = session_with(&["aaa", "bbb"], BroadcastPolicy::OnChange);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        session.handle_frame(a, &request_raw(1, handshake("aaa", "Alice")), Instant::now());
        let out = session.handle_frame(b, &request_raw(1, handshake("bbb", "Bob")), Instant::now());
        assert_eq!(out.len(), 3);

        // 被拒绝的动作不修改状态，不推送
        let bad = DoActionRequest { action: "Fold".into(), data: String::new() };
        let out = session.handle_frame(b, &request_raw(2, bad), Instant::now());
        assert_eq!(out.len(), 1);

        let good = DoActionRequest { action: "RaiseBet".into(), data: r#"{"bet":20}"#.into() };
        let out = parse(&session.handle_frame(a, &request_raw(2, good), Instant::now()));
        assert_eq!(out.len(), 3);
        assert_eq!(DoActionResponse::from_payload(&expect_response(&out[0].1).payload).unwrap().success, true);
        let (_, state, _) = expect_state_update(&out[1].1);
        assert_eq!(state.player_infos[0].bet, 20);
        assert_eq!(state.active_player, 1);
    }

    #[test]
    fn test_every_request_policy_rebroadcasts() {
        let mut session = session(&["aaa"]);
        let conn = ConnectionId::new();
        session.handle_frame(conn, &request_raw(1, handshake("aaa", "Alice")), Instant::now());

        let bad = DoActionRequest { action: "Dance".into(), data: String::new() };
        let out = session.handle_frame(conn, &request_raw(2, bad), Instant::now());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_overlong_name_is_rejected() {
        let mut session = session(&["aaa", "bbb"]);
        let conn = ConnectionId::new();

        // 全是引号的名字在状态推送里会被层层转义
        let name = "\"".repeat(MAX_NAME_LEN + 1);
        let out = parse(&session.handle_frame(conn, &request_raw(1, handshake("aaa", &name)), Instant::now()));
        let reply = expect_response(&out[0].1);
        assert_eq!(HandshakeResponse::from_payload(&reply.payload).unwrap(), HandshakeResponse { success: false });
        assert!(session.registry().is_empty());
        assert!(session.game_state().player_infos[0].name.is_empty());

        let name = "\"".repeat(MAX_NAME_LEN);
        let out = parse(&session.handle_frame(conn, &request_raw(2, handshake("aaa", &name)), Instant::now()));
        let reply = expect_response(&out[0].1);
        assert_eq!(HandshakeResponse::from_payload(&reply.payload).unwrap(), HandshakeResponse { success: true });
        assert_eq!(session.game_state().player_infos[0].name, name);
    }

    #[test]
    fn test_longest_names_still_fit_in_a_push() {
        let mut session = session(&["aaa", "bbb"]);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let name = "\"".repeat(MAX_NAME_LEN);
        session.handle_frame(a, &request_raw(1, handshake("aaa", &name)), Instant::now());
        let out = parse(&session.handle_frame(b, &request_raw(1, handshake("bbb", &name)), Instant::now()));

        assert_eq!(out.len(), 3);
        let (_, state, _) = expect_state_update(&out[1].1);
        assert_eq!(state.player_infos[1].name, name);
        assert_eq!(session.pending().len(), 2);
    }

    #[test]
    fn test_oversized_push_is_skipped_without_pending_entry() {
        let mut session = session(&["aaa"]);
        let conn = ConnectionId::new();
        let now = Instant::now();
        session.handle_frame(conn, &request_raw(1, handshake("aaa", "Alice")), now);
        let ack = Message::Response(UpdateGameStateResponse { success: true }.into_response(0).unwrap())
            .to_raw()
            .unwrap();
        session.handle_frame(conn, &ack, now);
        assert!(session.pending().is_empty());

        session.game_state.player_infos[0].name = "\"".repeat(6000);
        let mut out = Vec::new();
        session.broadcast_state(now, &mut out);
        assert!(out.is_empty());
        assert!(session.pending().is_empty());

        // 状态恢复正常后推送照常进行
        session.game_state.player_infos[0].name = "Alice".into();
        session.broadcast_state(now, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(session.pending().len(), 1);
    }

    #[test]
    fn test_duplicate_roster_entries_are_merged() {
        let mut session = session(&["aaa", "bbb", "aaa"]);
        assert_eq!(session.game_state().player_infos.len(), 2);

        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        session.handle_frame(a, &request_raw(1, handshake("aaa", "Alice")), Instant::now());
        assert_eq!(session.phase(), SessionPhase::WaitingForParticipants);
        let out = parse(&session.handle_frame(b, &request_raw(1, handshake("bbb", "Bob")), Instant::now()));

        assert_eq!(session.phase(), SessionPhase::WaitingForAction);
        assert_eq!(out.len(), 3);
        let (_, state, _) = expect_state_update(&out[1].1);
        assert_eq!(state.player_infos.len(), 2);
        assert!(state.player_infos.iter().all(|p| !p.name.is_empty()));
    }
}
