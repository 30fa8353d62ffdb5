//! Escape sequence recognition.
//!
//! Control sequences are described as token-level rules (literal bytes plus
//! Number / NumberList / String placeholders) and compiled once into a
//! deterministic automaton. The incremental parser feeds the DFA one token
//! at a time, assembling pending Number/NumberList/String tokens from the
//! byte stream as the current DFA state allows.

use std::sync::LazyLock;

/// Token placeholder used when describing a rule.
#[derive(Clone, Copy, Debug)]
pub enum DfaToken {
    Char(u8),
    Number,
    NumberList,
    Str,
}

/// Concrete token produced by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Char(u8),
    Number(u32),
    NumberList(Vec<u32>),
    Str(Vec<u8>),
}

/// One recognizable control sequence shape and the rule it accepts as.
pub struct EscapeCodeRule {
    tokens: Vec<DfaToken>,
    rule_num: u16,
}

impl EscapeCodeRule {
    pub fn new(rule_num: u16, tokens: &[DfaToken]) -> Self {
        Self {
            tokens: tokens.to_vec(),
            rule_num,
        }
    }
}

/// A DFA edge: destination state, or the accepted rule number when
/// `accept` is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct Transition {
    number: u16,
    exists: bool,
    accept: bool,
}

struct State {
    literals: [Transition; 256],
    num: Transition,
    num_list: Transition,
    string: Transition,
}

impl State {
    fn new() -> Self {
        Self {
            literals: [Transition::default(); 256],
            num: Transition::default(),
            num_list: Transition::default(),
            string: Transition::default(),
        }
    }

    fn by_dfa_token(&self, token: DfaToken) -> Transition {
        match token {
            DfaToken::Char(byte) => self.literals[byte as usize],
            DfaToken::Number => self.num,
            DfaToken::NumberList => self.num_list,
            DfaToken::Str => self.string,
        }
    }

    fn by_token(&self, token: &Token) -> Transition {
        match token {
            Token::Char(byte) => self.literals[*byte as usize],
            Token::Number(_) => self.num,
            Token::NumberList(_) => self.num_list,
            Token::Str(_) => self.string,
        }
    }

    fn add_transition(&mut self, token: DfaToken, transition: Transition) {
        match token {
            DfaToken::Char(byte) => self.literals[byte as usize] = transition,
            DfaToken::Number => self.num = transition,
            DfaToken::NumberList => self.num_list = transition,
            DfaToken::Str => self.string = transition,
        }
    }
}

/// The compiled automaton. State 0 is entered right after an ESC byte.
pub struct Dfa {
    states: Vec<State>,
}

impl Dfa {
    pub fn new(rules: &[EscapeCodeRule]) -> Self {
        let mut dfa = Self { states: Vec::new() };
        dfa.add_state();

        for rule in rules {
            dfa.add_rule(rule);
        }

        dfa
    }

    fn add_state(&mut self) -> u16 {
        self.states.push(State::new());
        (self.states.len() - 1) as u16
    }

    fn add_rule(&mut self, rule: &EscapeCodeRule) {
        let mut prev_state = 0u16;

        for (i, &token) in rule.tokens.iter().enumerate() {
            let transition = self.states[prev_state as usize].by_dfa_token(token);

            let next = if transition.exists {
                // Extending through an accepting edge would make two rules
                // accept at the same point.
                if transition.accept {
                    panic!("unsupported escape grammar: rules conflict at an accepting state");
                }
                transition.number
            } else {
                let next = self.add_state();
                let last = i == rule.tokens.len() - 1;
                self.states[prev_state as usize].add_transition(
                    token,
                    Transition {
                        number: if last { rule.rule_num } else { next },
                        exists: true,
                        accept: last,
                    },
                );
                next
            };

            prev_state = next;
        }
    }

    pub fn eat(&self, state: u16, token: &Token) -> Transition {
        self.states[state as usize].by_token(token)
    }

    pub fn has_string_transition(&self, state: u16) -> bool {
        self.states[state as usize].string.exists
    }

    pub fn has_num_transition(&self, state: u16) -> bool {
        self.states[state as usize].num.exists
    }

    pub fn has_num_list_transition(&self, state: u16) -> bool {
        self.states[state as usize].num_list.exists
    }
}

pub const ESCAPE_RULE_COUNT: usize = 33;

/// The full recognized grammar. Rule numbers index the dispatcher's match.
fn escape_rules() -> Vec<EscapeCodeRule> {
    use DfaToken::{Number as Num, NumberList as NumList, Str};

    fn lit(byte: u8) -> DfaToken {
        DfaToken::Char(byte)
    }

    let mut rules = vec![
        // Formatting (SGR)
        EscapeCodeRule::new(0, &[lit(b'['), NumList, lit(b'm')]),
        EscapeCodeRule::new(0, &[lit(b'['), Num, lit(b'm')]),
        EscapeCodeRule::new(0, &[lit(b'['), lit(b'm')]),
        // Cursor motion
        EscapeCodeRule::new(1, &[lit(b'['), Num, lit(b'A')]),
        EscapeCodeRule::new(2, &[lit(b'['), Num, lit(b'B')]),
        EscapeCodeRule::new(3, &[lit(b'['), Num, lit(b'C')]),
        EscapeCodeRule::new(4, &[lit(b'['), Num, lit(b'D')]),
        EscapeCodeRule::new(5, &[lit(b'['), Num, lit(b'E')]),
        EscapeCodeRule::new(6, &[lit(b'['), Num, lit(b'F')]),
        EscapeCodeRule::new(7, &[lit(b'['), Num, lit(b'G')]),
        EscapeCodeRule::new(8, &[lit(b'['), Num, lit(b'H')]),
        EscapeCodeRule::new(1, &[lit(b'['), lit(b'A')]),
        EscapeCodeRule::new(2, &[lit(b'['), lit(b'B')]),
        EscapeCodeRule::new(3, &[lit(b'['), lit(b'C')]),
        EscapeCodeRule::new(4, &[lit(b'['), lit(b'D')]),
        EscapeCodeRule::new(5, &[lit(b'['), lit(b'E')]),
        EscapeCodeRule::new(6, &[lit(b'['), lit(b'F')]),
        EscapeCodeRule::new(7, &[lit(b'['), lit(b'G')]),
        EscapeCodeRule::new(8, &[lit(b'['), lit(b'H')]),
        // DEC private modes
        EscapeCodeRule::new(9, &[lit(b'['), lit(b'?'), NumList, lit(b'h')]),
        EscapeCodeRule::new(9, &[lit(b'['), lit(b'?'), Num, lit(b'h')]),
        EscapeCodeRule::new(10, &[lit(b'['), lit(b'?'), NumList, lit(b'l')]),
        EscapeCodeRule::new(10, &[lit(b'['), lit(b'?'), Num, lit(b'l')]),
    ];

    // G0 character set designations, all rule 11.
    for byte in *b"ABC5H7KQ9RfYZ4=`E0<>IJ" {
        rules.push(EscapeCodeRule::new(11, &[lit(b'('), lit(byte)]));
    }
    for byte in *b">4?" {
        rules.push(EscapeCodeRule::new(11, &[lit(b'('), lit(b'"'), lit(byte)]));
    }
    for byte in *b"05326=" {
        rules.push(EscapeCodeRule::new(11, &[lit(b'('), lit(b'%'), lit(byte)]));
    }
    for byte in *b"45" {
        rules.push(EscapeCodeRule::new(11, &[lit(b'('), lit(b'&'), lit(byte)]));
    }

    rules.extend([
        EscapeCodeRule::new(12, &[lit(b'['), NumList, lit(b'H')]),
        EscapeCodeRule::new(12, &[lit(b'['), NumList, lit(b'f')]),
        EscapeCodeRule::new(13, &[lit(b'['), Num, lit(b'J')]),
        EscapeCodeRule::new(13, &[lit(b'['), lit(b'J')]),
        EscapeCodeRule::new(14, &[lit(b'['), Num, lit(b'K')]),
        EscapeCodeRule::new(14, &[lit(b'['), lit(b'K')]),
        EscapeCodeRule::new(15, &[Num]),
        EscapeCodeRule::new(16, &[lit(b'M')]),
        EscapeCodeRule::new(17, &[lit(b'['), NumList, lit(b'r')]),
        EscapeCodeRule::new(18, &[lit(b'['), Num, lit(b'L')]),
        EscapeCodeRule::new(18, &[lit(b'['), lit(b'L')]),
        EscapeCodeRule::new(19, &[lit(b'['), Num, lit(b'M')]),
        EscapeCodeRule::new(19, &[lit(b'['), lit(b'M')]),
        EscapeCodeRule::new(20, &[lit(b'['), Num, lit(b'@')]),
        EscapeCodeRule::new(20, &[lit(b'['), lit(b'@')]),
        EscapeCodeRule::new(21, &[lit(b'['), Num, lit(b'P')]),
        EscapeCodeRule::new(21, &[lit(b'['), lit(b'P')]),
        EscapeCodeRule::new(22, &[lit(b'['), Num, lit(b'X')]),
        EscapeCodeRule::new(22, &[lit(b'['), lit(b'X')]),
        EscapeCodeRule::new(23, &[lit(b'['), lit(b'S')]),
        EscapeCodeRule::new(23, &[lit(b'['), Num, lit(b'S')]),
        EscapeCodeRule::new(24, &[lit(b'['), lit(b'T')]),
        EscapeCodeRule::new(24, &[lit(b'['), Num, lit(b'T')]),
        EscapeCodeRule::new(25, &[lit(b'['), lit(b'd')]),
        EscapeCodeRule::new(25, &[lit(b'['), Num, lit(b'd')]),
        EscapeCodeRule::new(26, &[lit(b'['), lit(b'e')]),
        EscapeCodeRule::new(26, &[lit(b'['), Num, lit(b'e')]),
        EscapeCodeRule::new(27, &[lit(b'['), Num, lit(b'h')]),
        EscapeCodeRule::new(28, &[lit(b'['), Num, lit(b'l')]),
        EscapeCodeRule::new(29, &[lit(b']'), Num, lit(b';'), Str]),
        EscapeCodeRule::new(30, &[lit(b'P'), lit(b'+'), lit(b'Q'), Str]),
        EscapeCodeRule::new(31, &[lit(b'P'), lit(b'+'), lit(b'q'), Str]),
        EscapeCodeRule::new(32, &[lit(b'['), Num, lit(b' '), lit(b'q')]),
    ]);

    rules
}

static DFA: LazyLock<Dfa> = LazyLock::new(|| Dfa::new(&escape_rules()));

/// Outcome of feeding one byte to the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EatResult {
    /// Mid-sequence; feed more bytes.
    None,
    /// Not a recognized sequence; the parser has reset.
    Error,
    /// A rule completed; fetch it with [`EscapeParser::result`].
    Accept,
    /// A rule completed, but the byte just fed belongs to whatever follows
    /// the sequence and must be re-interpreted by the caller.
    AcceptButLastByteIsExtra,
}

/// A completed sequence: which rule matched, and the tokens it consumed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EscapeParseResult {
    pub rule_num: u16,
    pub tokens: Vec<Token>,
}

#[derive(Debug)]
enum PendingToken {
    None,
    Number(u32),
    NumberList { list: Vec<u32>, num: u32 },
    Str { bytes: Vec<u8>, prev_was_escape: bool },
}

/// Incremental recognizer fed one byte at a time, starting right after ESC.
pub struct EscapeParser {
    result_ready: bool,
    result: EscapeParseResult,
    dfa_state: u16,
    pending: PendingToken,
}

impl Default for EscapeParser {
    fn default() -> Self {
        Self {
            result_ready: false,
            result: EscapeParseResult::default(),
            dfa_state: 0,
            pending: PendingToken::None,
        }
    }
}

impl EscapeParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_token(&mut self, token: Token) -> EatResult {
        self.result.tokens.push(token);
        self.pending = PendingToken::None;

        let transition = DFA.eat(self.dfa_state, self.result.tokens.last().unwrap());

        if transition.accept {
            self.result.rule_num = transition.number;
            self.dfa_state = 0;
            self.result_ready = true;
            EatResult::Accept
        } else if !transition.exists {
            self.dfa_state = 0;
            self.result = EscapeParseResult::default();
            EatResult::Error
        } else {
            self.dfa_state = transition.number;
            EatResult::None
        }
    }

    /// Feeds the next byte of an escape sequence.
    pub fn eat_byte(&mut self, byte: u8) -> EatResult {
        match std::mem::replace(&mut self.pending, PendingToken::None) {
            PendingToken::None => {
                if byte.is_ascii_digit() {
                    self.pending = PendingToken::Number((byte - b'0') as u32);
                    EatResult::None
                } else if DFA.has_string_transition(self.dfa_state) {
                    self.pending = PendingToken::Str {
                        bytes: Vec::new(),
                        prev_was_escape: false,
                    };
                    self.eat_byte(byte)
                } else {
                    self.push_token(Token::Char(byte))
                }
            }

            PendingToken::Str {
                mut bytes,
                prev_was_escape,
            } => {
                // BEL terminates, as does ESC '\'; any other ESC is payload.
                if byte != 0x07 && (!prev_was_escape || byte != b'\\') {
                    let was_escape = byte == 0x1b;
                    bytes.push(byte);
                    self.pending = PendingToken::Str {
                        bytes,
                        prev_was_escape: was_escape,
                    };
                    EatResult::None
                } else {
                    if byte == b'\\' && prev_was_escape {
                        bytes.pop();
                    }
                    match self.push_token(Token::Str(bytes)) {
                        res @ (EatResult::Error | EatResult::Accept) => res,
                        _ => self.eat_byte(byte),
                    }
                }
            }

            PendingToken::Number(mut num) => {
                if byte.is_ascii_digit() {
                    num = num.wrapping_mul(10).wrapping_add((byte - b'0') as u32);
                    self.pending = PendingToken::Number(num);
                    EatResult::None
                } else if DFA.has_num_list_transition(self.dfa_state)
                    && (byte == b';' || byte == b':')
                {
                    self.pending = PendingToken::NumberList {
                        list: vec![num],
                        num: 0,
                    };
                    EatResult::None
                } else {
                    match self.push_token(Token::Number(num)) {
                        EatResult::Error => EatResult::Error,
                        EatResult::Accept => EatResult::AcceptButLastByteIsExtra,
                        _ => self.eat_byte(byte),
                    }
                }
            }

            PendingToken::NumberList { mut list, mut num } => {
                if byte.is_ascii_digit() {
                    num = num.wrapping_mul(10).wrapping_add((byte - b'0') as u32);
                    self.pending = PendingToken::NumberList { list, num };
                    EatResult::None
                } else if DFA.has_num_list_transition(self.dfa_state)
                    && (byte == b';' || byte == b':')
                {
                    list.push(num);
                    self.pending = PendingToken::NumberList { list, num: 0 };
                    EatResult::None
                } else {
                    list.push(num);
                    match self.push_token(Token::NumberList(list)) {
                        EatResult::Error => EatResult::Error,
                        EatResult::Accept => EatResult::AcceptButLastByteIsExtra,
                        _ => self.eat_byte(byte),
                    }
                }
            }
        }
    }

    /// Takes the completed sequence. Calling this when nothing accepted is a
    /// bug in the caller.
    pub fn result(&mut self) -> EscapeParseResult {
        assert!(self.result_ready, "escape parser result is not ready");
        self.result_ready = false;
        std::mem::take(&mut self.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds everything after the ESC byte; returns the accepted result and
    /// whether the final byte was flagged as extra.
    fn parse(bytes: &[u8]) -> (EscapeParseResult, bool) {
        let mut parser = EscapeParser::new();
        for (i, &byte) in bytes.iter().enumerate() {
            match parser.eat_byte(byte) {
                EatResult::Accept => {
                    assert_eq!(i, bytes.len() - 1, "accepted early");
                    return (parser.result(), false);
                }
                EatResult::AcceptButLastByteIsExtra => {
                    assert_eq!(i, bytes.len() - 1, "accepted early");
                    return (parser.result(), true);
                }
                EatResult::Error => panic!("parse error at byte {i}"),
                EatResult::None => {}
            }
        }
        panic!("sequence did not complete");
    }

    #[test]
    fn shortest_expansion_of_every_rule_accepts() {
        let cases: &[(&[u8], u16)] = &[
            (b"[m", 0),
            (b"[1m", 0),
            (b"[1;2m", 0),
            (b"[A", 1),
            (b"[3A", 1),
            (b"[B", 2),
            (b"[C", 3),
            (b"[D", 4),
            (b"[E", 5),
            (b"[F", 6),
            (b"[G", 7),
            (b"[H", 8),
            (b"[5H", 8),
            (b"[?25h", 9),
            (b"[?1000;1006h", 9),
            (b"[?25l", 10),
            (b"(B", 11),
            (b"(\"?", 11),
            (b"(%=", 11),
            (b"[2;3H", 12),
            (b"[2;3f", 12),
            (b"[J", 13),
            (b"[2J", 13),
            (b"[K", 14),
            (b"[1K", 14),
            (b"M", 16),
            (b"[1;24r", 17),
            (b"[L", 18),
            (b"[2L", 18),
            (b"[M", 19),
            (b"[2M", 19),
            (b"[@", 20),
            (b"[4@", 20),
            (b"[P", 21),
            (b"[4P", 21),
            (b"[X", 22),
            (b"[4X", 22),
            (b"[S", 23),
            (b"[2S", 23),
            (b"[T", 24),
            (b"[2T", 24),
            (b"[d", 25),
            (b"[5d", 25),
            (b"[e", 26),
            (b"[5e", 26),
            (b"[20h", 27),
            (b"[20l", 28),
            (b"]0;title\x07", 29),
            (b"P+Qname\x07", 30),
            (b"P+qname\x07", 31),
            (b"[2 q", 32),
        ];

        for &(bytes, expected) in cases {
            let (result, _) = parse(bytes);
            assert_eq!(
                result.rule_num, expected,
                "sequence {:?}",
                String::from_utf8_lossy(bytes)
            );
            assert!((result.rule_num as usize) < ESCAPE_RULE_COUNT);
        }
    }

    #[test]
    fn bare_number_accepts_with_trailing_byte_extra() {
        let mut parser = EscapeParser::new();
        assert_eq!(parser.eat_byte(b'7'), EatResult::None);
        assert_eq!(parser.eat_byte(b'x'), EatResult::AcceptButLastByteIsExtra);
        let result = parser.result();
        assert_eq!(result.rule_num, 15);
        assert_eq!(result.tokens, vec![Token::Number(7)]);
    }

    #[test]
    fn sgr_number_list_collects_params() {
        let (result, extra) = parse(b"[38;5;196m");
        assert!(!extra);
        assert_eq!(result.rule_num, 0);
        assert_eq!(
            result.tokens,
            vec![
                Token::Char(b'['),
                Token::NumberList(vec![38, 5, 196]),
                Token::Char(b'm'),
            ]
        );
    }

    #[test]
    fn colon_separates_like_semicolon() {
        let (result, _) = parse(b"[38:2:10:20:30m");
        assert_eq!(result.rule_num, 0);
        assert_eq!(
            result.tokens[1],
            Token::NumberList(vec![38, 2, 10, 20, 30])
        );
    }

    #[test]
    fn private_mode_tokens_hold_the_mode_list() {
        let (result, _) = parse(b"[?1049h");
        assert_eq!(result.rule_num, 9);
        assert_eq!(result.tokens[2], Token::Number(1049));
    }

    #[test]
    fn osc_string_terminated_by_bel() {
        let (result, _) = parse(b"]0;hello world\x07");
        assert_eq!(result.rule_num, 29);
        assert_eq!(result.tokens[3], Token::Str(b"hello world".to_vec()));
    }

    #[test]
    fn osc_string_terminated_by_st() {
        let (result, _) = parse(b"]52;clip data\x1b\\");
        assert_eq!(result.rule_num, 29);
        // The ESC of ESC-backslash is stripped from the payload.
        assert_eq!(result.tokens[3], Token::Str(b"clip data".to_vec()));
    }

    #[test]
    fn osc_string_keeps_embedded_escape() {
        let (result, _) = parse(b"]0;a\x1bb\x07");
        assert_eq!(result.tokens[3], Token::Str(b"a\x1bb".to_vec()));
    }

    #[test]
    fn unknown_sequence_errors_and_resets() {
        let mut parser = EscapeParser::new();
        assert_eq!(parser.eat_byte(b'['), EatResult::None);
        assert_eq!(parser.eat_byte(b'z'), EatResult::Error);
        // The parser is usable again from state 0.
        assert_eq!(parser.eat_byte(b'M'), EatResult::Accept);
        assert_eq!(parser.result().rule_num, 16);
    }

    #[test]
    fn charset_digit_finals_are_shadowed_by_number_tokens() {
        // `ESC ( 0` reads the digit as the start of a Number, and the state
        // after `(` has no number transition, so the push fails.
        let mut parser = EscapeParser::new();
        assert_eq!(parser.eat_byte(b'('), EatResult::None);
        assert_eq!(parser.eat_byte(b'0'), EatResult::None);
        assert_eq!(parser.eat_byte(b'x'), EatResult::Error);
    }

    #[test]
    #[should_panic(expected = "result is not ready")]
    fn taking_a_result_twice_panics() {
        let mut parser = EscapeParser::new();
        assert_eq!(parser.eat_byte(b'M'), EatResult::Accept);
        parser.result();
        parser.result();
    }

    #[test]
    fn overlong_numbers_do_not_panic() {
        let mut parser = EscapeParser::new();
        for &byte in b"[99999999999999999999" {
            assert_ne!(parser.eat_byte(byte), EatResult::Error);
        }
    }
}
