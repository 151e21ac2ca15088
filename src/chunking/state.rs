//! Byte-level scanner that finds top-level objects inside a JSON array.
//!
//! The scanner never parses values. It only tracks nesting depth and whether
//! the current byte sits inside a string literal, which is enough to find the
//! exact byte span of every top-level element.

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringState {
    Outside,
    Inside,
    /// Just consumed a backslash inside a string
    Escape,
}

impl StringState {
    /// Advance the string sub-state. Returns `true` when the byte was part of
    /// (or opened/closed) a string literal and must not affect depth.
    fn advance(&mut self, byte: u8) -> bool {
        match *self {
            StringState::Outside => {
                if byte == b'"' {
                    *self = StringState::Inside;
                    true
                } else {
                    false
                }
            }
            StringState::Inside => {
                match byte {
                    b'\\' => *self = StringState::Escape,
                    b'"' => *self = StringState::Outside,
                    _ => {}
                }
                true
            }
            StringState::Escape => {
                *self = StringState::Inside;
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Waiting for `[` (or a wrapper `{`)
    BeforeArray,
    /// Inside a wrapper object, looking for its first array-valued field
    InWrapper { depth: usize, string: StringState },
    /// Between elements of the record array
    InArray,
    InObject { depth: usize, string: StringState },
    /// Inside a non-object element (scalar or nested array) of the record array
    InStray { depth: usize, string: StringState },
    /// The record array has been closed; remaining bytes are ignored
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    ArrayOpened,
    ObjectStarted,
    ObjectCompleted,
    StrayStarted,
    ArrayClosed,
    /// A byte that cannot start the record array
    Unexpected(u8),
}

#[derive(Debug, Clone)]
pub struct Scanner {
    state: ScanState,
    offset: u64,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::BeforeArray,
            offset: 0,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Absolute offset of the next byte to be scanned
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn in_object(&self) -> bool {
        matches!(self.state, ScanState::InObject { .. })
    }

    pub fn is_done(&self) -> bool {
        self.state == ScanState::Done
    }

    pub fn step(&mut self, byte: u8) -> Transition {
        let offset = self.offset;
        self.offset += 1;

        match self.state {
            ScanState::BeforeArray => match byte {
                b'[' => {
                    self.state = ScanState::InArray;
                    Transition::ArrayOpened
                }
                b'{' => {
                    self.state = ScanState::InWrapper {
                        depth: 1,
                        string: StringState::Outside,
                    };
                    Transition::None
                }
                b if b.is_ascii_whitespace() => Transition::None,
                b if offset < 3 && UTF8_BOM[offset as usize] == b => Transition::None,
                b => Transition::Unexpected(b),
            },

            ScanState::InWrapper { depth, mut string } => {
                if string.advance(byte) {
                    self.state = ScanState::InWrapper { depth, string };
                    return Transition::None;
                }
                match byte {
                    // Arrays cannot be keys, so a `[` at depth 1 is a field value
                    b'[' if depth == 1 => {
                        self.state = ScanState::InArray;
                        Transition::ArrayOpened
                    }
                    b'{' | b'[' => {
                        self.state = ScanState::InWrapper {
                            depth: depth + 1,
                            string,
                        };
                        Transition::None
                    }
                    b'}' | b']' if depth == 1 => {
                        self.state = ScanState::Done;
                        Transition::Unexpected(byte)
                    }
                    b'}' | b']' => {
                        self.state = ScanState::InWrapper {
                            depth: depth - 1,
                            string,
                        };
                        Transition::None
                    }
                    _ => Transition::None,
                }
            }

            ScanState::InArray => match byte {
                b'{' => {
                    self.state = ScanState::InObject {
                        depth: 1,
                        string: StringState::Outside,
                    };
                    Transition::ObjectStarted
                }
                b']' => {
                    self.state = ScanState::Done;
                    Transition::ArrayClosed
                }
                b',' => Transition::None,
                b if b.is_ascii_whitespace() => Transition::None,
                b => {
                    let mut string = StringState::Outside;
                    string.advance(b);
                    self.state = ScanState::InStray {
                        depth: usize::from(b == b'['),
                        string,
                    };
                    Transition::StrayStarted
                }
            },

            ScanState::InObject { depth, mut string } => {
                if string.advance(byte) {
                    self.state = ScanState::InObject { depth, string };
                    return Transition::None;
                }
                match byte {
                    b'{' | b'[' => {
                        self.state = ScanState::InObject {
                            depth: depth + 1,
                            string,
                        };
                        Transition::None
                    }
                    b'}' | b']' if depth == 1 => {
                        self.state = ScanState::InArray;
                        Transition::ObjectCompleted
                    }
                    b'}' | b']' => {
                        self.state = ScanState::InObject {
                            depth: depth - 1,
                            string,
                        };
                        Transition::None
                    }
                    _ => Transition::None,
                }
            }

            ScanState::InStray { depth, mut string } => {
                if string.advance(byte) {
                    self.state = ScanState::InStray { depth, string };
                    return Transition::None;
                }
                match byte {
                    b',' if depth == 0 => {
                        self.state = ScanState::InArray;
                        Transition::None
                    }
                    b']' if depth == 0 => {
                        self.state = ScanState::Done;
                        Transition::ArrayClosed
                    }
                    b'{' | b'[' => {
                        self.state = ScanState::InStray {
                            depth: depth + 1,
                            string,
                        };
                        Transition::None
                    }
                    b'}' | b']' => {
                        self.state = ScanState::InStray {
                            depth: depth.saturating_sub(1),
                            string,
                        };
                        Transition::None
                    }
                    _ => Transition::None,
                }
            }

            ScanState::Done => Transition::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(scanner: &mut Scanner, bytes: &[u8]) -> Vec<Transition> {
        bytes
            .iter()
            .map(|b| scanner.step(*b))
            .filter(|t| *t != Transition::None)
            .collect()
    }

    #[test]
    fn test_before_array_to_in_array() {
        let mut scanner = Scanner::new();
        assert_eq!(scanner.step(b' '), Transition::None);
        assert_eq!(scanner.step(b'\n'), Transition::None);
        assert_eq!(scanner.step(b'['), Transition::ArrayOpened);
        assert_eq!(scanner.state(), ScanState::InArray);
    }

    #[test]
    fn test_before_array_skips_bom() {
        let mut scanner = Scanner::new();
        assert_eq!(feed(&mut scanner, &[0xEF, 0xBB, 0xBF, b'[']), vec![Transition::ArrayOpened]);
    }

    #[test]
    fn test_before_array_rejects_garbage() {
        let mut scanner = Scanner::new();
        assert_eq!(scanner.step(b'x'), Transition::Unexpected(b'x'));

        // A BOM byte past the start of the stream is not a BOM
        let mut scanner = Scanner::new();
        feed(&mut scanner, b"   ");
        assert_eq!(scanner.step(0xEF), Transition::Unexpected(0xEF));
    }

    #[test]
    fn test_before_array_to_wrapper_to_in_array() {
        let mut scanner = Scanner::new();
        let transitions = feed(&mut scanner, br#"{"Count": 2, "meta": {"tags": ["a"]}, "ActiveChatters": ["#);
        assert_eq!(transitions, vec![Transition::ArrayOpened]);
        assert_eq!(scanner.state(), ScanState::InArray);
    }

    #[test]
    fn test_wrapper_ignores_brackets_in_strings() {
        let mut scanner = Scanner::new();
        let transitions = feed(&mut scanner, br#"{"note": "[not it]", "items": ["#);
        assert_eq!(transitions, vec![Transition::ArrayOpened]);
    }

    #[test]
    fn test_wrapper_without_array_is_unexpected() {
        let mut scanner = Scanner::new();
        let transitions = feed(&mut scanner, br#"{"Count": 0}"#);
        assert_eq!(transitions, vec![Transition::Unexpected(b'}')]);
        assert!(scanner.is_done());
    }

    #[test]
    fn test_in_array_to_in_object_and_back() {
        let mut scanner = Scanner::new();
        feed(&mut scanner, b"[");
        assert_eq!(scanner.step(b'{'), Transition::ObjectStarted);
        assert!(scanner.in_object());
        assert_eq!(scanner.step(b'}'), Transition::ObjectCompleted);
        assert_eq!(scanner.state(), ScanState::InArray);
    }

    #[test]
    fn test_in_object_tracks_nesting() {
        let mut scanner = Scanner::new();
        let transitions = feed(&mut scanner, br#"[{"a": {"b": [1, {"c": 2}]}}"#);
        assert_eq!(
            transitions,
            vec![
                Transition::ArrayOpened,
                Transition::ObjectStarted,
                Transition::ObjectCompleted
            ]
        );
    }

    #[test]
    fn test_in_object_ignores_braces_in_strings() {
        let mut scanner = Scanner::new();
        let transitions = feed(&mut scanner, br#"[{"text": "}{ \"}\" ]"}"#);
        assert_eq!(
            transitions,
            vec![
                Transition::ArrayOpened,
                Transition::ObjectStarted,
                Transition::ObjectCompleted
            ]
        );
    }

    #[test]
    fn test_escape_state_consumes_one_byte() {
        let mut string = StringState::Inside;
        assert!(string.advance(b'\\'));
        assert_eq!(string, StringState::Escape);
        assert!(string.advance(b'\\'));
        assert_eq!(string, StringState::Inside);
        assert!(string.advance(b'"'));
        assert_eq!(string, StringState::Outside);
    }

    #[test]
    fn test_in_array_to_stray_and_back() {
        let mut scanner = Scanner::new();
        let transitions = feed(&mut scanner, br#"[1, "x,]", [2, 3], {}"#);
        assert_eq!(
            transitions,
            vec![
                Transition::ArrayOpened,
                Transition::StrayStarted,
                Transition::StrayStarted,
                Transition::StrayStarted,
                Transition::ObjectStarted,
                Transition::ObjectCompleted,
            ]
        );
        assert_eq!(scanner.state(), ScanState::InArray);
    }

    #[test]
    fn test_stray_closes_array() {
        let mut scanner = Scanner::new();
        let transitions = feed(&mut scanner, b"[true]");
        assert_eq!(
            transitions,
            vec![
                Transition::ArrayOpened,
                Transition::StrayStarted,
                Transition::ArrayClosed
            ]
        );
    }

    #[test]
    fn test_in_array_to_done() {
        let mut scanner = Scanner::new();
        feed(&mut scanner, b"[{},");
        assert_eq!(scanner.step(b']'), Transition::ArrayClosed);
        assert!(scanner.is_done());
        assert_eq!(scanner.step(b'{'), Transition::None);
        assert_eq!(scanner.offset(), 6);
    }
}
