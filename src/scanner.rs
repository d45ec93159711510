use std::borrow::Cow;
use std::iter::FusedIterator;

/// Scanner takes in an input and spits out tokens.
#[derive(Debug)]
pub struct Scanner<'a> {
    input: &'a str,
    // Rather than a second &str marking where the current token started, we keep the number of
    // bytes of `input` consumed by the token being scanned:
    // - scanned_input_len is the length of the in-progress lexeme
    // - unscanned_input() is everything after it
    // - reset_scanned_input() drops the finished lexeme from the front of `input`
    scanned_input_len: usize,
    current_line: usize,
    ended: bool,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals.
    Identifier,
    String,
    Number,
    // Keywords.
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

/// The value a literal token denotes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal<'t> {
    /// A numeric literal, always a double.
    Number(f64),
    /// A string literal's contents, without the surrounding quotes.
    String(&'t str),
}

/// Token is a single token, including a ref to the raw characters that constitute it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    typ: TokenType,
    // Error tokens carry a message instead of source text, and those messages are sometimes
    // formatted at runtime, hence the Cow.
    lexeme: Cow<'a, str>,
    line: usize,
}

impl<'a> Token<'a> {
    pub(crate) fn new(typ: TokenType, lexeme: impl Into<Cow<'a, str>>, line: usize) -> Token<'a> {
        Token {
            typ,
            lexeme: lexeme.into(),
            line,
        }
    }

    /// What kind of token this is.
    pub fn typ(&self) -> TokenType {
        self.typ
    }

    /// The source text of the token. For `TokenType::Error` this is the error message instead.
    pub fn lexeme(&self) -> &str {
        &self.lexeme
    }

    /// Line on which the token ends.
    pub fn line(&self) -> usize {
        self.line
    }

    /// The literal value of a Number or String token.
    pub fn literal(&self) -> Option<Literal<'_>> {
        match self.typ {
            TokenType::Number => self.lexeme.parse().ok().map(Literal::Number),
            TokenType::String => self
                .lexeme
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .map(Literal::String),
            _ => None,
        }
    }
}

impl<'a> Scanner<'a> {
    /// Returns a fresh Scanner, ready to spit out tokens from the given source
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            input: source,
            current_line: 1,
            ended: false,
            scanned_input_len: 0,
        }
    }

    /// Returns the next token from the input, advancing the scanner.
    /// Errors are represented in-band as TokenType::Error.
    /// The scanner will return one Eof token, then None afterwards.
    pub fn next_token(&mut self) -> Option<Token<'a>> {
        self.skip_whitespace();
        let next_char = match self.take_next_char() {
            None if self.ended => return None,
            None => {
                self.ended = true;
                return Some(Token::new(TokenType::Eof, "", self.current_line));
            }
            Some(c) => c,
        };
        let token = match next_char {
            '(' => self.make_token(TokenType::LeftParen),
            ')' => self.make_token(TokenType::RightParen),
            '{' => self.make_token(TokenType::LeftBrace),
            '}' => self.make_token(TokenType::RightBrace),
            ';' => self.make_token(TokenType::Semicolon),
            ',' => self.make_token(TokenType::Comma),
            '.' => self.make_token(TokenType::Dot),
            '-' => self.make_token(TokenType::Minus),
            '+' => self.make_token(TokenType::Plus),
            '/' => self.make_token(TokenType::Slash),
            '*' => self.make_token(TokenType::Star),
            '!' => self.make_token_if_followed_by('=', TokenType::BangEqual, TokenType::Bang),
            '=' => self.make_token_if_followed_by('=', TokenType::EqualEqual, TokenType::Equal),
            '<' => self.make_token_if_followed_by('=', TokenType::LessEqual, TokenType::Less),
            '>' => {
                self.make_token_if_followed_by('=', TokenType::GreaterEqual, TokenType::Greater)
            }
            '"' => self.scan_string_literal(),
            '0'..='9' => self.scan_numeric_literal(),
            c if is_identifier_start(c) => self.scan_identifier_or_keyword(),
            c => self.err_token(format!("Unexpected character '{}'.", c)),
        };
        self.reset_scanned_input();
        Some(token)
    }

    fn unscanned_input(&self) -> &'a str {
        if self.scanned_input_len < self.input.len() {
            &self.input[self.scanned_input_len..]
        } else {
            ""
        }
    }

    fn peek_next_char(&self) -> Option<char> {
        self.unscanned_input().chars().next()
    }

    fn peek_next_next_char(&self) -> Option<char> {
        self.unscanned_input().chars().nth(1)
    }

    fn take_next_char(&mut self) -> Option<char> {
        let next_char = self.peek_next_char()?;
        self.scanned_input_len += next_char.len_utf8();
        Some(next_char)
    }

    fn take_next_char_if_matches(&mut self, target: char) -> bool {
        match self.peek_next_char() {
            Some(c) if c == target => {
                self.scanned_input_len += c.len_utf8();
                true
            }
            _ => false,
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek_next_char() {
                Some('\n') => {
                    self.current_line += 1;
                    self.take_next_char();
                }
                Some(c) if c.is_whitespace() => {
                    // only \n counts as a newline
                    self.take_next_char();
                }
                Some('/') if self.peek_next_next_char() == Some('/') => {
                    // Leave the \n (if any) for the outer loop so the line still gets counted.
                    while !matches!(self.peek_next_char(), Some('\n') | None) {
                        self.take_next_char();
                    }
                }
                _ => break,
            }
        }
        self.reset_scanned_input();
    }

    // Makes a token of the given type from the scanned portion of input.
    // Does NOT reset scanned input.
    fn make_token(&self, typ: TokenType) -> Token<'a> {
        Token::new(typ, &self.input[0..self.scanned_input_len], self.current_line)
    }

    fn make_token_if_followed_by(
        &mut self,
        next: char,
        two_char: TokenType,
        one_char: TokenType,
    ) -> Token<'a> {
        if self.take_next_char_if_matches(next) {
            self.make_token(two_char)
        } else {
            self.make_token(one_char)
        }
    }

    fn err_token(&self, message: String) -> Token<'a> {
        Token::new(TokenType::Error, message, self.current_line)
    }

    fn reset_scanned_input(&mut self) {
        self.input = self.unscanned_input();
        self.scanned_input_len = 0;
    }

    // Assumes we have just scanned the initial double-quote. There are no escape sequences, so a
    // double-quote can never appear inside a literal. The lexeme includes both quotes.
    fn scan_string_literal(&mut self) -> Token<'a> {
        loop {
            match self.take_next_char() {
                Some('"') => return self.make_token(TokenType::String),
                Some('\n') => self.current_line += 1,
                Some(_) => {}
                None => return self.err_token("Unterminated string.".to_string()),
            }
        }
    }

    // '1.' is not a valid literal: '1.a' scans as three tokens, one, dot, 'a'.
    // The dot only joins the number when a digit follows it.
    fn scan_numeric_literal(&mut self) -> Token<'a> {
        while let Some('0'..='9') = self.peek_next_char() {
            self.take_next_char();
        }
        if self.peek_next_char() == Some('.')
            && matches!(self.peek_next_next_char(), Some('0'..='9'))
        {
            self.take_next_char(); // decimal
            while let Some('0'..='9') = self.peek_next_char() {
                self.take_next_char();
            }
        }
        self.make_token(TokenType::Number)
    }

    fn scan_identifier_or_keyword(&mut self) -> Token<'a> {
        while self.peek_next_char().map_or(false, is_identifier_char) {
            self.take_next_char();
        }
        self.make_token(token_type_from_str(&self.input[0..self.scanned_input_len]))
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

// assumes text is not empty
fn token_type_from_str(token_text: &str) -> TokenType {
    let mut chars = token_text.chars();
    let rest = |skip: usize| token_text.get(skip..).unwrap_or("");
    match chars.next() {
        Some('a') => keyword_if_equal(rest(1), "nd", TokenType::And),
        Some('c') => keyword_if_equal(rest(1), "lass", TokenType::Class),
        Some('e') => keyword_if_equal(rest(1), "lse", TokenType::Else),
        Some('i') => keyword_if_equal(rest(1), "f", TokenType::If),
        Some('n') => keyword_if_equal(rest(1), "il", TokenType::Nil),
        Some('o') => keyword_if_equal(rest(1), "r", TokenType::Or),
        Some('p') => keyword_if_equal(rest(1), "rint", TokenType::Print),
        Some('r') => keyword_if_equal(rest(1), "eturn", TokenType::Return),
        Some('s') => keyword_if_equal(rest(1), "uper", TokenType::Super),
        Some('v') => keyword_if_equal(rest(1), "ar", TokenType::Var),
        Some('w') => keyword_if_equal(rest(1), "hile", TokenType::While),
        Some('f') => match chars.next() {
            Some('a') => keyword_if_equal(rest(2), "lse", TokenType::False),
            Some('o') => keyword_if_equal(rest(2), "r", TokenType::For),
            Some('u') => keyword_if_equal(rest(2), "n", TokenType::Fun),
            _ => TokenType::Identifier,
        },
        Some('t') => match chars.next() {
            Some('h') => keyword_if_equal(rest(2), "is", TokenType::This),
            Some('r') => keyword_if_equal(rest(2), "ue", TokenType::True),
            _ => TokenType::Identifier,
        },
        _ => TokenType::Identifier,
    }
}

fn keyword_if_equal(text: &str, keyword_text: &str, typ: TokenType) -> TokenType {
    if text == keyword_text {
        typ
    } else {
        TokenType::Identifier
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token()
    }
}

impl<'a> FusedIterator for Scanner<'a> {}

#[cfg(test)]
mod test {
    use super::*;

    fn scan(text: &str) -> Vec<(TokenType, String, usize)> {
        Scanner::new(text)
            .map(|t| (t.typ(), t.lexeme().to_string(), t.line()))
            .collect()
    }

    #[test]
    fn operators_comments_and_lines() {
        let input = r#"
( // comment
) ( { != == = = ! = /
123.1= /123
"#;
        let expected: Vec<_> = [
            (TokenType::LeftParen, "(", 2),
            (TokenType::RightParen, ")", 3),
            (TokenType::LeftParen, "(", 3),
            (TokenType::LeftBrace, "{", 3),
            (TokenType::BangEqual, "!=", 3),
            (TokenType::EqualEqual, "==", 3),
            (TokenType::Equal, "=", 3),
            (TokenType::Equal, "=", 3),
            (TokenType::Bang, "!", 3),
            (TokenType::Equal, "=", 3),
            (TokenType::Slash, "/", 3),
            (TokenType::Number, "123.1", 4),
            (TokenType::Equal, "=", 4),
            (TokenType::Slash, "/", 4),
            (TokenType::Number, "123", 4),
            (TokenType::Eof, "", 5),
        ]
        .into_iter()
        .map(|(typ, lexeme, line)| (typ, lexeme.to_string(), line))
        .collect();
        assert_eq!(scan(input), expected);
    }

    #[test]
    fn keywords_and_identifiers() {
        let text = "and class else if nil or print return super var while false for fun true this f t fAlse thIS _x a_1";
        let expected = vec![
            TokenType::And,
            TokenType::Class,
            TokenType::Else,
            TokenType::If,
            TokenType::Nil,
            TokenType::Or,
            TokenType::Print,
            TokenType::Return,
            TokenType::Super,
            TokenType::Var,
            TokenType::While,
            TokenType::False,
            TokenType::For,
            TokenType::Fun,
            TokenType::True,
            TokenType::This,
            TokenType::Identifier,
            TokenType::Identifier,
            TokenType::Identifier,
            TokenType::Identifier,
            TokenType::Identifier,
            TokenType::Identifier,
            TokenType::Eof,
        ];
        let got: Vec<_> = Scanner::new(text).map(|t| t.typ()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn literals() {
        let tokens: Vec<_> = Scanner::new(r#"12.5 "hi there" 7"#).collect();
        assert_eq!(tokens[0].literal(), Some(Literal::Number(12.5)));
        assert_eq!(tokens[1].literal(), Some(Literal::String("hi there")));
        assert_eq!(tokens[1].lexeme(), r#""hi there""#);
        assert_eq!(tokens[2].literal(), Some(Literal::Number(7.0)));
        assert_eq!(tokens[3].literal(), None);
    }

    #[test]
    fn comment_at_end_of_input() {
        let tokens = scan("print 1; // no trailing newline");
        assert_eq!(tokens.last().map(|t| t.0), Some(TokenType::Eof));
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn multiline_string_counts_lines() {
        let tokens = scan("\"a\nb\" x");
        assert_eq!(tokens[0], (TokenType::String, "\"a\nb\"".to_string(), 2));
        assert_eq!(tokens[1], (TokenType::Identifier, "x".to_string(), 2));
    }

    #[test]
    fn errors_are_in_band() {
        let tokens = scan("@ \"open");
        assert_eq!(
            tokens[0],
            (TokenType::Error, "Unexpected character '@'.".to_string(), 1)
        );
        assert_eq!(
            tokens[1],
            (TokenType::Error, "Unterminated string.".to_string(), 1)
        );
        assert_eq!(tokens[2].0, TokenType::Eof);
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn fused_after_eof() {
        let mut scanner = Scanner::new("");
        assert_eq!(scanner.next().map(|t| t.typ()), Some(TokenType::Eof));
        assert_eq!(scanner.next(), None);
        assert_eq!(scanner.next(), None);
    }
}
