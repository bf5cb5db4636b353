use crate::shared::{ErrorKind, RelayError, RelayResult};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use wick::logging::{self, Logger};

pub const IAC: u8 = 255;

pub const SE: u8 = 240;
pub const NOP: u8 = 241;
pub const DM: u8 = 242;
pub const BRK: u8 = 243;
pub const IP: u8 = 244;
pub const AO: u8 = 245;
pub const AYT: u8 = 246;
pub const EC: u8 = 247;
pub const EL: u8 = 248;
pub const GA: u8 = 249;
pub const SB: u8 = 250;
pub const WILL: u8 = 251;
pub const WONT: u8 = 252;
pub const DO: u8 = 253;
pub const DONT: u8 = 254;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SUPPRESS_GO_AHEAD: u8 = 3;
pub const OPT_TERMINAL_TYPE: u8 = 24;
pub const OPT_NAWS: u8 = 31;
pub const OPT_LINEMODE: u8 = 34;

/// TERMINAL-TYPE subnegotiation verbs (RFC 1091).
const TTYPE_IS: u8 = 0;

/// LINEMODE subnegotiation verbs (RFC 1184).
const LINEMODE_MODE: u8 = 1;
const LINEMODE_MODE_ACK: u8 = 0x04;

/// Bound on accumulated subnegotiation parameters.
const SUBNEG_MAX: usize = 256;

/// Bound on negotiation messages sent for a single option. Past this the
/// option is considered hostile and negotiation for it goes silent.
const MAX_NEGOTIATION_ATTEMPTS: u8 = 10;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ParseState {
    Ground,
    SawIac,
    /// Holds the pending WILL/WONT/DO/DONT verb.
    SawVerb(u8),
    SawSb,
    InSubneg,
    SawSbIac,
}

/// RFC 1143 per-side option state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum QState {
    No,
    Yes,
    WantNo,
    WantYes,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum QQueue {
    Empty,
    Opposite,
}

#[derive(Debug, Copy, Clone)]
struct OptionState {
    us: QState,
    usq: QQueue,
    him: QState,
    himq: QQueue,
    attempts: u8,
    muted: bool,
}

impl Default for OptionState {
    fn default() -> OptionState {
        OptionState {
            us: QState::No,
            usq: QQueue::Empty,
            him: QState::No,
            himq: QQueue::Empty,
            attempts: 0,
            muted: false,
        }
    }
}

/// Byte-level telnet engine: decodes IAC sequences out of the inbound stream,
/// runs loop-safe option negotiation, and escapes outbound data. Cleaned
/// application bytes land in `app_out`; anything the peer must see (responses,
/// subnegotiation replies) lands in `wire_out`.
pub struct TelnetSession {
    state: ParseState,
    subneg_option: u8,
    subneg: Vec<u8>,
    options: HashMap<u8, OptionState>,
    window: Option<(u16, u16)>,
    terminal_type: Option<String>,
    log: Logger,
}

impl TelnetSession {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> TelnetSession {
        let session_log = match log.into() {
            Some(log) => log.new(logging::o!("proto" => "telnet")),
            None => logging::discard(),
        };

        TelnetSession {
            state: ParseState::Ground,
            subneg_option: 0,
            subneg: Vec::new(),
            options: HashMap::new(),
            window: None,
            terminal_type: None,
            log: session_log,
        }
    }

    /// Remote window size, if the peer has sent NAWS.
    pub fn window(&self) -> Option<(u16, u16)> {
        self.window
    }

    pub fn terminal_type(&self) -> Option<&str> {
        self.terminal_type.as_deref()
    }

    pub fn him_enabled(&self, option: u8) -> bool {
        self.options
            .get(&option)
            .map_or(false, |state| state.him == QState::Yes)
    }

    pub fn us_enabled(&self, option: u8) -> bool {
        self.options
            .get(&option)
            .map_or(false, |state| state.us == QState::Yes)
    }

    /// Options we are willing to perform ourselves when the peer asks.
    fn us_allowed(option: u8) -> bool {
        matches!(option, OPT_ECHO | OPT_SUPPRESS_GO_AHEAD)
    }

    /// Options we are willing to let the peer perform.
    fn him_allowed(option: u8) -> bool {
        matches!(
            option,
            OPT_SUPPRESS_GO_AHEAD | OPT_TERMINAL_TYPE | OPT_NAWS | OPT_LINEMODE
        )
    }

    /// Server-side opening negotiation: announce that we echo and suppress
    /// go-ahead.
    pub fn initial_negotiation(&mut self, wire_out: &mut Vec<u8>) {
        self.request_us_enable(OPT_ECHO, wire_out);
        self.request_us_enable(OPT_SUPPRESS_GO_AHEAD, wire_out);
    }

    /// The read half of the adapter: consumes raw socket bytes, appends
    /// cleaned application bytes to `app_out` and protocol responses to
    /// `wire_out`.
    pub fn decode(
        &mut self,
        input: &[u8],
        app_out: &mut Vec<u8>,
        wire_out: &mut Vec<u8>,
    ) -> RelayResult<()> {
        for &byte in input {
            match self.state {
                ParseState::Ground => {
                    if byte == IAC {
                        self.state = ParseState::SawIac;
                    } else {
                        app_out.push(byte);
                    }
                }
                ParseState::SawIac => match byte {
                    IAC => {
                        // Escaped data byte.
                        app_out.push(IAC);
                        self.state = ParseState::Ground;
                    }
                    SB => self.state = ParseState::SawSb,
                    WILL | WONT | DO | DONT => self.state = ParseState::SawVerb(byte),
                    // SE is only meaningful inside a subnegotiation.
                    SE => self.state = ParseState::Ground,
                    NOP..=GA => {
                        self.on_command(byte);
                        self.state = ParseState::Ground;
                    }
                    other => {
                        logging::warn!(self.log, "dropping unknown telnet command";
                                       "byte" => other);
                        self.state = ParseState::Ground;
                    }
                },
                ParseState::SawVerb(verb) => {
                    self.negotiate(verb, byte, wire_out);
                    self.state = ParseState::Ground;
                }
                ParseState::SawSb => {
                    self.subneg_option = byte;
                    self.subneg.clear();
                    self.state = ParseState::InSubneg;
                }
                ParseState::InSubneg => {
                    if byte == IAC {
                        self.state = ParseState::SawSbIac;
                    } else {
                        self.push_subneg(byte)?;
                    }
                }
                ParseState::SawSbIac => match byte {
                    IAC => {
                        // Escaped parameter byte.
                        self.push_subneg(IAC)?;
                        self.state = ParseState::InSubneg;
                    }
                    SE => {
                        self.on_subnegotiation(wire_out);
                        self.state = ParseState::Ground;
                    }
                    other => {
                        logging::warn!(self.log, "malformed subnegotiation terminator";
                                       "option" => self.subneg_option,
                                       "byte" => other);
                        self.subneg.clear();
                        self.state = ParseState::Ground;
                    }
                },
            }
        }

        Ok(())
    }

    fn push_subneg(&mut self, byte: u8) -> RelayResult<()> {
        if self.subneg.len() >= SUBNEG_MAX {
            logging::warn!(self.log, "subnegotiation buffer overflow, aborting";
                           "option" => self.subneg_option);
            self.subneg.clear();
            self.state = ParseState::Ground;
            return Err(RelayError::Fatal(ErrorKind::SubnegOverflow));
        }
        self.subneg.push(byte);
        Ok(())
    }

    fn on_command(&mut self, command: u8) {
        logging::debug!(self.log, "standalone telnet command"; "command" => command);
    }

    fn on_subnegotiation(&mut self, wire_out: &mut Vec<u8>) {
        match self.subneg_option {
            OPT_NAWS => {
                if self.subneg.len() == 4 {
                    let width = BigEndian::read_u16(&self.subneg[0..2]);
                    let height = BigEndian::read_u16(&self.subneg[2..4]);
                    self.window = Some((width, height));
                    logging::debug!(self.log, "peer window size";
                                    "width" => width, "height" => height);
                } else {
                    logging::warn!(self.log, "ignoring malformed NAWS body";
                                   "len" => self.subneg.len());
                }
            }
            OPT_TERMINAL_TYPE => {
                if self.subneg.first() == Some(&TTYPE_IS) {
                    let name = String::from_utf8_lossy(&self.subneg[1..]).into_owned();
                    logging::debug!(self.log, "peer terminal type"; "term" => name.as_str());
                    self.terminal_type = Some(name);
                }
            }
            OPT_LINEMODE => {
                // Basic MODE handling: acknowledge whatever mask the client
                // proposes.
                if self.subneg.len() >= 2 && self.subneg[0] == LINEMODE_MODE {
                    let mask = self.subneg[1];
                    if mask & LINEMODE_MODE_ACK == 0 {
                        wire_out.extend_from_slice(&[
                            IAC,
                            SB,
                            OPT_LINEMODE,
                            LINEMODE_MODE,
                            mask | LINEMODE_MODE_ACK,
                            IAC,
                            SE,
                        ]);
                    }
                }
            }
            other => {
                logging::debug!(self.log, "unhandled subnegotiation";
                                "option" => other, "len" => self.subneg.len());
            }
        }
        self.subneg.clear();
    }

    fn send_verb(state: &mut OptionState, verb: u8, option: u8, wire_out: &mut Vec<u8>, log: &Logger) {
        if state.muted {
            return;
        }
        if state.attempts >= MAX_NEGOTIATION_ATTEMPTS {
            state.muted = true;
            logging::warn!(log, "negotiation loop bound reached, muting option";
                           "option" => option);
            return;
        }
        state.attempts += 1;
        wire_out.extend_from_slice(&[IAC, verb, option]);
    }

    /// RFC 1143 Q-method receive handling for WILL/WONT/DO/DONT.
    fn negotiate(&mut self, verb: u8, option: u8, wire_out: &mut Vec<u8>) {
        let log = self.log.clone();
        let state = self.options.entry(option).or_default();

        if state.muted {
            return;
        }

        match verb {
            WILL => match state.him {
                QState::No => {
                    if Self::him_allowed(option) {
                        state.him = QState::Yes;
                        Self::send_verb(state, DO, option, wire_out, &log);
                    } else {
                        Self::send_verb(state, DONT, option, wire_out, &log);
                    }
                }
                QState::Yes => {}
                QState::WantNo => match state.himq {
                    QQueue::Empty => {
                        logging::warn!(log, "DONT answered by WILL"; "option" => option);
                        state.him = QState::No;
                    }
                    QQueue::Opposite => {
                        state.him = QState::Yes;
                        state.himq = QQueue::Empty;
                    }
                },
                QState::WantYes => match state.himq {
                    QQueue::Empty => state.him = QState::Yes,
                    QQueue::Opposite => {
                        state.him = QState::WantNo;
                        state.himq = QQueue::Empty;
                        Self::send_verb(state, DONT, option, wire_out, &log);
                    }
                },
            },
            WONT => match state.him {
                QState::No => {}
                QState::Yes => {
                    state.him = QState::No;
                    Self::send_verb(state, DONT, option, wire_out, &log);
                }
                QState::WantNo => match state.himq {
                    QQueue::Empty => state.him = QState::No,
                    QQueue::Opposite => {
                        state.him = QState::WantYes;
                        state.himq = QQueue::Empty;
                        Self::send_verb(state, DO, option, wire_out, &log);
                    }
                },
                QState::WantYes => {
                    state.him = QState::No;
                    state.himq = QQueue::Empty;
                }
            },
            DO => match state.us {
                QState::No => {
                    if Self::us_allowed(option) {
                        state.us = QState::Yes;
                        Self::send_verb(state, WILL, option, wire_out, &log);
                    } else {
                        Self::send_verb(state, WONT, option, wire_out, &log);
                    }
                }
                QState::Yes => {}
                QState::WantNo => match state.usq {
                    QQueue::Empty => {
                        logging::warn!(log, "WONT answered by DO"; "option" => option);
                        state.us = QState::No;
                    }
                    QQueue::Opposite => {
                        state.us = QState::Yes;
                        state.usq = QQueue::Empty;
                    }
                },
                QState::WantYes => match state.usq {
                    QQueue::Empty => state.us = QState::Yes,
                    QQueue::Opposite => {
                        state.us = QState::WantNo;
                        state.usq = QQueue::Empty;
                        Self::send_verb(state, WONT, option, wire_out, &log);
                    }
                },
            },
            DONT => match state.us {
                QState::No => {}
                QState::Yes => {
                    state.us = QState::No;
                    Self::send_verb(state, WONT, option, wire_out, &log);
                }
                QState::WantNo => match state.usq {
                    QQueue::Empty => state.us = QState::No,
                    QQueue::Opposite => {
                        state.us = QState::WantYes;
                        state.usq = QQueue::Empty;
                        Self::send_verb(state, WILL, option, wire_out, &log);
                    }
                },
                QState::WantYes => {
                    state.us = QState::No;
                    state.usq = QQueue::Empty;
                }
            },
            _ => unreachable!("negotiate called with non-negotiation verb"),
        }
    }

    /// Asks the peer to start performing `option` (sends DO).
    pub fn request_him_enable(&mut self, option: u8, wire_out: &mut Vec<u8>) {
        let log = self.log.clone();
        let state = self.options.entry(option).or_default();
        match state.him {
            QState::No => {
                state.him = QState::WantYes;
                Self::send_verb(state, DO, option, wire_out, &log);
            }
            QState::WantNo => state.himq = QQueue::Opposite,
            QState::Yes | QState::WantYes => {}
        }
    }

    /// Announces that we want to start performing `option` (sends WILL).
    pub fn request_us_enable(&mut self, option: u8, wire_out: &mut Vec<u8>) {
        let log = self.log.clone();
        let state = self.options.entry(option).or_default();
        match state.us {
            QState::No => {
                state.us = QState::WantYes;
                Self::send_verb(state, WILL, option, wire_out, &log);
            }
            QState::WantNo => state.usq = QQueue::Opposite,
            QState::Yes | QState::WantYes => {}
        }
    }

    /// Sends a NAWS body for a static window size, doubling any 0xFF bytes.
    pub fn send_naws(width: u16, height: u16, wire_out: &mut Vec<u8>) {
        let mut raw = [0u8; 4];
        BigEndian::write_u16(&mut raw[0..2], width);
        BigEndian::write_u16(&mut raw[2..4], height);

        wire_out.extend_from_slice(&[IAC, SB, OPT_NAWS]);
        for &byte in &raw {
            wire_out.push(byte);
            if byte == IAC {
                wire_out.push(IAC);
            }
        }
        wire_out.extend_from_slice(&[IAC, SE]);
    }
}

/// The write half of the adapter: every application 0xFF is doubled on the
/// wire.
pub fn encode(src: &[u8], dst: &mut Vec<u8>) {
    for &byte in src {
        dst.push(byte);
        if byte == IAC {
            dst.push(IAC);
        }
    }
}

/// Emits `IAC command [option]`.
pub fn encode_command(command: u8, option: Option<u8>, dst: &mut Vec<u8>) {
    dst.push(IAC);
    dst.push(command);
    if let Some(option) = option {
        dst.push(option);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn decode_all(session: &mut TelnetSession, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut app = Vec::new();
        let mut wire = Vec::new();
        session.decode(input, &mut app, &mut wire).unwrap();
        (app, wire)
    }

    #[test]
    fn test_iac_doubling_round_trip() {
        let app_bytes = [0xFE, 0xFF, 0xFF, 0x00];

        let mut wire = Vec::new();
        encode(&app_bytes, &mut wire);
        assert_eq!(wire, vec![0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);

        let mut session = TelnetSession::new(None);
        let (decoded, responses) = decode_all(&mut session, &wire);

        assert_eq!(decoded, app_bytes.to_vec());
        assert!(responses.is_empty());
        // Pure data: no option state materializes.
        assert!(session.options.is_empty());
    }

    #[test]
    fn test_encode_decode_identity_on_random_streams() {
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let len = rng.gen_range(0..2000);
            let data: Vec<u8> = (0..len).map(|_| rng.gen::<u8>()).collect();

            let mut wire = Vec::new();
            encode(&data, &mut wire);

            let mut session = TelnetSession::new(None);
            let mut decoded = Vec::new();
            let mut responses = Vec::new();
            session.decode(&wire, &mut decoded, &mut responses).unwrap();

            assert_eq!(decoded, data);
            assert!(responses.is_empty());
        }
    }

    #[test]
    fn test_will_accepted_option() {
        let mut session = TelnetSession::new(None);
        let (app, wire) = decode_all(&mut session, &[IAC, WILL, OPT_SUPPRESS_GO_AHEAD]);

        assert!(app.is_empty());
        assert_eq!(wire, vec![IAC, DO, OPT_SUPPRESS_GO_AHEAD]);
        assert!(session.him_enabled(OPT_SUPPRESS_GO_AHEAD));
    }

    #[test]
    fn test_will_refused_option() {
        let mut session = TelnetSession::new(None);
        // We do not let the peer take over echoing.
        let (_, wire) = decode_all(&mut session, &[IAC, WILL, OPT_ECHO]);

        assert_eq!(wire, vec![IAC, DONT, OPT_ECHO]);
        assert!(!session.him_enabled(OPT_ECHO));
    }

    #[test]
    fn test_do_accepted_and_refused() {
        let mut session = TelnetSession::new(None);

        let (_, wire) = decode_all(&mut session, &[IAC, DO, OPT_ECHO]);
        assert_eq!(wire, vec![IAC, WILL, OPT_ECHO]);
        assert!(session.us_enabled(OPT_ECHO));

        let (_, wire) = decode_all(&mut session, &[IAC, DO, OPT_NAWS]);
        assert_eq!(wire, vec![IAC, WONT, OPT_NAWS]);
        assert!(!session.us_enabled(OPT_NAWS));
    }

    #[test]
    fn test_wont_disables_enabled_option() {
        let mut session = TelnetSession::new(None);
        decode_all(&mut session, &[IAC, WILL, OPT_NAWS]);
        assert!(session.him_enabled(OPT_NAWS));

        let (_, wire) = decode_all(&mut session, &[IAC, WONT, OPT_NAWS]);
        assert_eq!(wire, vec![IAC, DONT, OPT_NAWS]);
        assert!(!session.him_enabled(OPT_NAWS));
    }

    #[test]
    fn test_duplicate_will_is_silent() {
        let mut session = TelnetSession::new(None);
        decode_all(&mut session, &[IAC, WILL, OPT_NAWS]);
        let (_, wire) = decode_all(&mut session, &[IAC, WILL, OPT_NAWS]);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_negotiation_loop_is_bounded() {
        let mut session = TelnetSession::new(None);
        let mut total_responses = 0usize;

        // A hostile peer flapping WILL/WONT forever only ever draws a bounded
        // number of responses.
        for _ in 0..100 {
            let (_, wire) = decode_all(&mut session, &[IAC, WILL, OPT_NAWS]);
            total_responses += wire.len() / 3;
            let (_, wire) = decode_all(&mut session, &[IAC, WONT, OPT_NAWS]);
            total_responses += wire.len() / 3;
        }

        assert!(total_responses <= usize::from(MAX_NEGOTIATION_ATTEMPTS));
    }

    #[test]
    fn test_naws_subnegotiation() {
        let mut session = TelnetSession::new(None);
        let (app, wire) = decode_all(&mut session, &[IAC, SB, OPT_NAWS, 0, 80, 0, 24, IAC, SE]);

        assert!(app.is_empty());
        assert!(wire.is_empty());
        assert_eq!(session.window(), Some((80, 24)));
    }

    #[test]
    fn test_naws_with_escaped_parameter() {
        let mut session = TelnetSession::new(None);
        // Height low byte 0xFF arrives doubled inside the body.
        let (_, _) = decode_all(
            &mut session,
            &[IAC, SB, OPT_NAWS, 0, 80, 0, IAC, IAC, IAC, SE],
        );

        assert_eq!(session.window(), Some((80, 255)));
    }

    #[test]
    fn test_terminal_type_subnegotiation() {
        let mut session = TelnetSession::new(None);
        let mut body = vec![IAC, SB, OPT_TERMINAL_TYPE, TTYPE_IS];
        body.extend_from_slice(b"xterm-256color");
        body.extend_from_slice(&[IAC, SE]);

        decode_all(&mut session, &body);
        assert_eq!(session.terminal_type(), Some("xterm-256color"));
    }

    #[test]
    fn test_linemode_mode_is_acknowledged() {
        let mut session = TelnetSession::new(None);
        let (_, wire) = decode_all(
            &mut session,
            &[IAC, SB, OPT_LINEMODE, LINEMODE_MODE, 0x03, IAC, SE],
        );

        assert_eq!(
            wire,
            vec![
                IAC,
                SB,
                OPT_LINEMODE,
                LINEMODE_MODE,
                0x03 | LINEMODE_MODE_ACK,
                IAC,
                SE
            ]
        );
    }

    #[test]
    fn test_subneg_overflow_is_fatal() {
        let mut session = TelnetSession::new(None);
        let mut app = Vec::new();
        let mut wire = Vec::new();

        let mut input = vec![IAC, SB, OPT_TERMINAL_TYPE];
        input.extend(std::iter::repeat(b'a').take(SUBNEG_MAX + 10));

        let err = session.decode(&input, &mut app, &mut wire).unwrap_err();
        assert_eq!(err, RelayError::Fatal(ErrorKind::SubnegOverflow));

        // The machine is reusable afterwards.
        let (app, _) = decode_all(&mut session, b"ok");
        assert_eq!(app, b"ok".to_vec());
    }

    #[test]
    fn test_standalone_commands_pass_through() {
        let mut session = TelnetSession::new(None);
        let (app, wire) = decode_all(&mut session, &[IAC, AYT, b'x', IAC, NOP, b'y']);

        assert_eq!(app, vec![b'x', b'y']);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_stray_se_is_ignored() {
        let mut session = TelnetSession::new(None);
        let (app, wire) = decode_all(&mut session, &[b'a', IAC, SE, b'b']);

        assert_eq!(app, vec![b'a', b'b']);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_split_sequences_across_reads() {
        let mut session = TelnetSession::new(None);

        let (app, wire) = decode_all(&mut session, &[IAC]);
        assert!(app.is_empty() && wire.is_empty());

        let (app, wire) = decode_all(&mut session, &[WILL]);
        assert!(app.is_empty() && wire.is_empty());

        let (_, wire) = decode_all(&mut session, &[OPT_SUPPRESS_GO_AHEAD]);
        assert_eq!(wire, vec![IAC, DO, OPT_SUPPRESS_GO_AHEAD]);
    }

    #[test]
    fn test_send_naws_doubles_iac() {
        let mut wire = Vec::new();
        TelnetSession::send_naws(80, 0x01FF, &mut wire);

        assert_eq!(
            wire,
            vec![IAC, SB, OPT_NAWS, 0, 80, 1, IAC, IAC, IAC, SE]
        );
    }

    #[test]
    fn test_initial_negotiation_announces_echo_and_sga() {
        let mut session = TelnetSession::new(None);
        let mut wire = Vec::new();
        session.initial_negotiation(&mut wire);

        assert_eq!(
            wire,
            vec![IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SUPPRESS_GO_AHEAD]
        );

        // Peer agreement completes the handshake without further traffic.
        let (_, responses) = decode_all(&mut session, &[IAC, DO, OPT_ECHO]);
        assert!(responses.is_empty());
        assert!(session.us_enabled(OPT_ECHO));
    }

    #[test]
    fn test_encode_command() {
        let mut wire = Vec::new();
        encode_command(DO, Some(OPT_NAWS), &mut wire);
        encode_command(AYT, None, &mut wire);
        assert_eq!(wire, vec![IAC, DO, OPT_NAWS, IAC, AYT]);
    }
}
