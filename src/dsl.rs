//! Reader for package-definition source text.
//!
//! Definitions are Ruby-shaped:
//!
//! ```text
//! class Foo < Formula
//!   desc "Foo tool"
//!   url "https://example.com/foo-1.0.tar.gz"
//!   depends_on "pkgconf" => :build
//!   on_linux do
//!     depends_on "zlib"
//!   end
//!   def install
//!     system "make", "install"
//!   end
//! end
//! ```
//!
//! Nothing is executed. The text is tokenized and grouped into a tree of
//! [`Statement`]s: class and module bodies, method calls with literal
//! arguments and optional blocks, conditionals, and `def` bodies. Arguments
//! that are not plain literals are kept as source text ([`Literal::Expr`]).
//! Structural problems (an unterminated string or heredoc, a missing or stray
//! `end`, an unbalanced bracket) are reported as [`DslError`].
//!
//! [`active_statements`] then flattens a body for a [`Platform`], inlining
//! `on_macos`/`on_linux`/`on_arm`/`on_intel`/`on_<os>`/`on_system` blocks and
//! the branches of `if OS.mac?`-style conditionals that apply.

use crate::platform::{Arch, Os, Platform, macos_rank};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DslError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for DslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for DslError {}

type DslResult<T> = std::result::Result<T, DslError>;

/// A literal argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Sym(String),
    Int(i64),
    Bool(bool),
    Nil,
    Array(Vec<Literal>),
    Hash(Vec<(Literal, Literal)>),
    /// Anything that is not a plain literal, as source text.
    Expr(String),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sym(&self) -> Option<&str> {
        match self {
            Literal::Sym(s) => Some(s),
            _ => None,
        }
    }

    /// String or symbol text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Literal::Str(s) | Literal::Sym(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Literal::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Elements of an array, or the value itself as a one-element list.
    pub fn as_list(&self) -> Vec<&Literal> {
        match self {
            Literal::Array(items) => items.iter().collect(),
            other => vec![other],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub line: usize,
    pub kind: StatementKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Call(Call),
    Class {
        name: String,
        superclass: Option<String>,
        body: Vec<Statement>,
    },
    Module {
        name: String,
        body: Vec<Statement>,
    },
    Def {
        name: String,
        body: Vec<Statement>,
    },
    /// `if`/`unless`/`case` with its branches in source order.
    Conditional(Vec<Branch>),
    /// `begin` body.
    Group(Vec<Statement>),
    /// A line that is just a literal, such as the heredoc inside `def caveats`.
    Literal(Literal),
    /// Assignments, loops and other expressions, as source text.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Call {
    pub receiver: Option<String>,
    pub method: String,
    pub args: Vec<Literal>,
    pub kwargs: Vec<(String, Literal)>,
    pub block: Option<Vec<Statement>>,
    /// Trailing `if`/`unless` modifier.
    pub modifier: Option<Condition>,
}

impl Call {
    pub fn arg(&self, index: usize) -> Option<&Literal> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Literal> {
        self.kwargs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Positional string arguments.
    pub fn strings(&self) -> Vec<&str> {
        self.args.iter().filter_map(Literal::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    /// `None` for the `else` branch.
    pub condition: Option<Condition>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub negated: bool,
    pub text: String,
}

/// A parsed source file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub statements: Vec<Statement>,
}

impl Document {
    pub fn parse(source: &str) -> DslResult<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        let statements = Parser::new(tokens).parse_document()?;
        Ok(Self { statements })
    }

    /// Names of the classes defined at the top level, in source order.
    pub fn class_names(&self) -> Vec<String> {
        self.statements
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StatementKind::Class { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Body of the top-level class called `name`.
    pub fn class_body(&self, name: &str) -> Option<&[Statement]> {
        self.statements.iter().find_map(|stmt| match &stmt.kind {
            StatementKind::Class {
                name: class_name,
                body,
                ..
            } if class_name == name => Some(body.as_slice()),
            _ => None,
        })
    }

    /// Token and body of every top-level `cask "token" do ... end`.
    pub fn casks(&self) -> Vec<(&str, &[Statement])> {
        self.statements
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StatementKind::Call(call) if call.method == "cask" && call.receiver.is_none() => {
                    let token = call.arg(0)?.as_str()?;
                    let body = call.block.as_deref()?;
                    Some((token, body))
                }
                _ => None,
            })
            .collect()
    }
}

/// Flatten `body` for `platform`.
///
/// Platform blocks and conditionals that apply are inlined; the rest are
/// dropped. Conditionals whose condition cannot be decided are dropped whole,
/// while calls with an undecidable modifier are kept.
pub fn active_statements<'a>(body: &'a [Statement], platform: &Platform) -> Vec<&'a Statement> {
    let mut active = Vec::new();
    collect_active(body, platform, &mut active);
    active
}

fn collect_active<'a>(body: &'a [Statement], platform: &Platform, out: &mut Vec<&'a Statement>) {
    for stmt in body {
        match &stmt.kind {
            StatementKind::Call(call) => {
                if let Some(modifier) = &call.modifier
                    && eval_condition(modifier, platform) == Some(false)
                {
                    continue;
                }
                match (platform_block_applies(call, platform), &call.block) {
                    (Some(true), Some(block)) => collect_active(block, platform, out),
                    (Some(false), _) => {}
                    _ => out.push(stmt),
                }
            }
            StatementKind::Conditional(branches) => {
                let mut taken = None;
                for branch in branches {
                    match &branch.condition {
                        None => {
                            taken = Some(branch);
                            break;
                        }
                        Some(condition) => match eval_condition(condition, platform) {
                            Some(true) => {
                                taken = Some(branch);
                                break;
                            }
                            Some(false) => {}
                            None => {
                                tracing::debug!(
                                    "line {}: skipping conditional on `{}`",
                                    stmt.line,
                                    condition.text
                                );
                                break;
                            }
                        },
                    }
                }
                if let Some(branch) = taken {
                    collect_active(&branch.body, platform, out);
                }
            }
            StatementKind::Group(body) => collect_active(body, platform, out),
            _ => out.push(stmt),
        }
    }
}

/// Whether an `on_*` block applies. `None` when `call` is not a platform block.
pub fn platform_block_applies(call: &Call, platform: &Platform) -> Option<bool> {
    if call.receiver.is_some() {
        return None;
    }
    let method = call.method.as_str();
    let suffix = method.strip_prefix("on_")?;

    match suffix {
        "macos" => Some(platform.is_macos()),
        "linux" => Some(platform.is_linux()),
        "arm" => Some(platform.arch == Arch::Arm64),
        "intel" => Some(platform.arch == Arch::X86_64),
        "system" => {
            let wants_linux = call.args.iter().any(|arg| arg.as_sym() == Some("linux"));
            let macos_bound = call.kwarg("macos").and_then(Literal::as_text);
            Some(match platform.os {
                Os::Linux => wants_linux,
                Os::MacOs(_) => match macos_bound {
                    Some(bound) => macos_bound_matches(platform, bound),
                    None => false,
                },
            })
        }
        release if macos_rank(release).is_some() => {
            let bound = match call.arg(0).and_then(Literal::as_sym) {
                Some("or_newer") => format!("{}_or_newer", release),
                Some("or_older") => format!("{}_or_older", release),
                _ => release.to_string(),
            };
            Some(macos_bound_matches(platform, &bound))
        }
        _ => None,
    }
}

/// `sonoma`, `sonoma_or_newer`, `sonoma_or_older` against the platform.
fn macos_bound_matches(platform: &Platform, bound: &str) -> bool {
    let Os::MacOs(version) = platform.os else {
        return false;
    };
    let current = version.rank();

    let (name, cmp): (&str, fn(usize, usize) -> bool) =
        if let Some(name) = bound.strip_suffix("_or_newer") {
            (name, |cur, want| cur >= want)
        } else if let Some(name) = bound.strip_suffix("_or_older") {
            (name, |cur, want| cur <= want)
        } else {
            (bound, |cur, want| cur == want)
        };

    macos_rank(name).is_some_and(|want| cmp(current, want))
}

/// Evaluate a platform condition such as `OS.mac? && Hardware::CPU.arm?`.
///
/// `None` when any part of the condition is not a platform query.
pub fn eval_condition(condition: &Condition, platform: &Platform) -> Option<bool> {
    let value = eval_expression(&condition.text, platform)?;
    Some(value != condition.negated)
}

fn eval_expression(text: &str, platform: &Platform) -> Option<bool> {
    let text = text.trim();
    if let Some((left, right)) = text.split_once("||") {
        return Some(eval_expression(left, platform)? || eval_expression(right, platform)?);
    }
    if let Some((left, right)) = text.split_once("&&") {
        return Some(eval_expression(left, platform)? && eval_expression(right, platform)?);
    }
    if let Some(inner) = text.strip_prefix('!') {
        return eval_expression(inner, platform).map(|v| !v);
    }
    if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        return eval_expression(inner, platform);
    }

    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    match compact.as_str() {
        "OS.mac?" => return Some(platform.is_macos()),
        "OS.linux?" => return Some(platform.is_linux()),
        "Hardware::CPU.arm?" => return Some(platform.arch == Arch::Arm64),
        "Hardware::CPU.intel?" => return Some(platform.arch == Arch::X86_64),
        _ => {}
    }

    let rest = compact.strip_prefix("MacOS.version")?;
    for (op, bound_suffix) in [
        (">=", "_or_newer"),
        ("<=", "_or_older"),
        ("==", ""),
    ] {
        if let Some(name) = rest.strip_prefix(op) {
            let name = name.trim_start_matches(':');
            return Some(macos_bound_matches(
                platform,
                &format!("{}{}", name, bound_suffix),
            ));
        }
    }
    for (op, newer) in [(">", true), ("<", false)] {
        if let Some(name) = rest.strip_prefix(op) {
            let name = name.trim_start_matches(':');
            let Os::MacOs(version) = platform.os else {
                return Some(false);
            };
            let want = macos_rank(name)?;
            return Some(if newer {
                version.rank() > want
            } else {
                version.rank() < want
            });
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Const(String),
    Str(String),
    Sym(String),
    Num(String),
    Label(String),
    Regex(String),
    Words { symbols: bool, words: Vec<String> },
    Arrow,
    Punct(char),
    Op(&'static str),
    Newline,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    space_before: bool,
}

struct PendingHeredoc {
    token_index: usize,
    terminator: String,
    squiggly: bool,
    indented_end: bool,
    line: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
    space_before: bool,
    pending: Vec<PendingHeredoc>,
}

const BLOCK_KEYWORDS: [&str; 8] = ["if", "unless", "while", "until", "case", "begin", "for", "def"];

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            tokens: Vec::new(),
            space_before: false,
            pending: Vec::new(),
        }
    }

    fn error<T>(&self, line: usize, message: impl Into<String>) -> DslResult<T> {
        Err(DslError {
            line,
            message: message.into(),
        })
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok, line: usize) {
        self.tokens.push(Token {
            tok,
            line,
            space_before: self.space_before,
        });
        self.space_before = false;
    }

    fn at_line_start(&self) -> bool {
        self.pos == 0 || self.chars.get(self.pos - 1) == Some(&'\n')
    }

    fn rest_of_line_is(&self, word: &str) -> bool {
        let end = self.chars[self.pos..]
            .iter()
            .position(|&c| c == '\n')
            .map_or(self.chars.len(), |i| self.pos + i);
        let line: String = self.chars[self.pos..end].iter().collect();
        line.trim_end() == word
    }

    fn tokenize(mut self) -> DslResult<Vec<Token>> {
        while let Some(c) = self.peek(0) {
            if self.at_line_start() {
                if self.rest_of_line_is("__END__") {
                    break;
                }
                if self.rest_of_line_is("=begin") {
                    self.skip_block_comment()?;
                    continue;
                }
            }

            match c {
                ' ' | '\t' | '\r' => {
                    self.pos += 1;
                    self.space_before = true;
                }
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                    self.space_before = true;
                }
                '\n' => {
                    self.push(Tok::Newline, self.line);
                    self.pos += 1;
                    self.line += 1;
                    if !self.pending.is_empty() {
                        self.read_heredoc_bodies()?;
                    }
                }
                ';' => {
                    self.push(Tok::Newline, self.line);
                    self.pos += 1;
                }
                '#' => {
                    while self.peek(0).is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '"' | '`' => {
                    let line = self.line;
                    self.pos += 1;
                    let text = self.read_interpolated(c)?;
                    self.push(Tok::Str(text), line);
                }
                '\'' => {
                    let line = self.line;
                    self.pos += 1;
                    let text = self.read_single_quoted('\'')?;
                    self.push(Tok::Str(text), line);
                }
                ':' => self.lex_colon()?,
                '%' if self.percent_literal_ahead() => self.lex_percent()?,
                '/' if self.regex_allowed() => {
                    let line = self.line;
                    self.pos += 1;
                    let body = self.read_delimited('/', None, true)?;
                    self.skip_regex_flags();
                    self.push(Tok::Regex(format!("/{}/", body)), line);
                }
                '<' if self.heredoc_ahead() => self.lex_heredoc_start(),
                '?' if self.char_literal_ahead() => {
                    let line = self.line;
                    let ch = self.peek(1).unwrap_or_default();
                    self.pos += 2;
                    self.push(Tok::Str(ch.to_string()), line);
                }
                c if c.is_ascii_digit() => self.lex_number(),
                c if c.is_alphabetic() || c == '_' || c == '@' || c == '$' => self.lex_word(),
                _ => self.lex_operator(),
            }
        }

        if let Some(pending) = self.pending.first() {
            return self.error(
                pending.line,
                format!("unterminated heredoc, missing {}", pending.terminator),
            );
        }
        Ok(self.tokens)
    }

    fn skip_block_comment(&mut self) -> DslResult<()> {
        let start = self.line;
        loop {
            let Some(offset) = self.chars[self.pos..].iter().position(|&c| c == '\n') else {
                return self.error(start, "unterminated =begin comment");
            };
            self.pos += offset + 1;
            self.line += 1;
            if self.rest_of_line_is("=end") {
                while self.peek(0).is_some_and(|c| c != '\n') {
                    self.pos += 1;
                }
                return Ok(());
            }
        }
    }

    fn lex_colon(&mut self) -> DslResult<()> {
        let line = self.line;
        match self.peek(1) {
            Some(':') => {
                self.pos += 2;
                self.push(Tok::Op("::"), line);
            }
            Some('"') => {
                self.pos += 2;
                let text = self.read_interpolated('"')?;
                self.push(Tok::Sym(text), line);
            }
            Some(c) if c.is_alphabetic() || c == '_' => {
                self.pos += 1;
                let mut name = self.read_identifier();
                if matches!(self.peek(0), Some('?' | '!' | '=')) && self.peek(1) != Some('>') {
                    if let Some(c) = self.peek(0) {
                        name.push(c);
                    }
                    self.pos += 1;
                }
                self.push(Tok::Sym(name), line);
            }
            _ => {
                self.pos += 1;
                self.push(Tok::Punct(':'), line);
            }
        }
        Ok(())
    }

    fn read_identifier(&mut self) -> String {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn lex_word(&mut self) {
        let line = self.line;
        let mut prefix = String::new();
        while let Some(c @ ('@' | '$')) = self.peek(0) {
            prefix.push(c);
            self.pos += 1;
        }
        let mut word = prefix + &self.read_identifier();

        // `?`/`!` suffixes, but not `!=`.
        if let Some(c @ ('?' | '!')) = self.peek(0)
            && self.peek(1) != Some('=')
        {
            word.push(c);
            self.pos += 1;
        }

        // `key: value`, but not `Foo::Bar` or a ternary `a ? b : c`.
        if self.peek(0) == Some(':') && self.peek(1) != Some(':') {
            self.pos += 1;
            self.push(Tok::Label(word), line);
            return;
        }

        let starts_upper = word.chars().next().is_some_and(char::is_uppercase);
        if starts_upper {
            self.push(Tok::Const(word), line);
        } else {
            self.push(Tok::Ident(word), line);
        }
    }

    fn lex_number(&mut self) {
        let line = self.line;
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_ascii_digit() || c == '_')
        {
            self.pos += 1;
        }
        if self.peek(0) == Some('.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self
                .peek(0)
                .is_some_and(|c| c.is_ascii_digit() || c == '_')
            {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        self.push(Tok::Num(text.replace('_', "")), line);
    }

    fn lex_operator(&mut self) {
        let line = self.line;
        let c = self.peek(0).unwrap_or_default();
        let next = self.peek(1);
        let op: Option<&'static str> = match (c, next) {
            ('=', Some('>')) => {
                self.pos += 2;
                self.push(Tok::Arrow, line);
                return;
            }
            ('=', Some('=')) => Some("=="),
            ('=', Some('~')) => Some("=~"),
            ('!', Some('=')) => Some("!="),
            ('!', Some('~')) => Some("!~"),
            ('&', Some('&')) => Some("&&"),
            ('|', Some('|')) => Some("||"),
            ('<', Some('=')) => Some("<="),
            ('>', Some('=')) => Some(">="),
            ('<', Some('<')) => Some("<<"),
            ('.', Some('.')) => Some(".."),
            ('&', Some('.')) => Some("&."),
            ('-', Some('>')) => Some("->"),
            ('+', Some('=')) => Some("+="),
            ('-', Some('=')) => Some("-="),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 2;
                // `||=` and friends.
                if matches!(op, "||" | "&&") && self.peek(0) == Some('=') {
                    self.pos += 1;
                    self.push(Tok::Op("||="), line);
                } else {
                    self.push(Tok::Op(op), line);
                }
            }
            None => {
                self.pos += 1;
                self.push(Tok::Punct(c), line);
            }
        }
    }

    fn previous(&self) -> Option<&Token> {
        self.tokens.last()
    }

    /// Whether the upcoming `/` opens a regex rather than dividing.
    fn regex_allowed(&self) -> bool {
        let Some(prev) = self.previous() else {
            return true;
        };
        match &prev.tok {
            Tok::Newline | Tok::Arrow | Tok::Op(_) | Tok::Label(_) => true,
            Tok::Punct(c) => "([{,=!&|<>+-*:?".contains(*c),
            Tok::Ident(word) => {
                matches!(word.as_str(), "if" | "unless" | "when" | "and" | "or" | "not" | "return")
                    || (self.space_before && self.peek(1).is_some_and(|c| c != ' ' && c != '='))
            }
            _ => false,
        }
    }

    fn skip_regex_flags(&mut self) {
        while self.peek(0).is_some_and(|c| c.is_ascii_alphabetic()) {
            self.pos += 1;
        }
    }

    fn percent_literal_ahead(&self) -> bool {
        let value_expected = match self.previous().map(|t| &t.tok) {
            None | Some(Tok::Newline | Tok::Arrow | Tok::Op(_) | Tok::Label(_)) => true,
            Some(Tok::Punct(c)) => "([{,=".contains(*c),
            Some(Tok::Ident(_)) => self.space_before,
            _ => false,
        };
        if !value_expected {
            return false;
        }
        match (self.peek(1), self.peek(2)) {
            (Some('w' | 'W' | 'i' | 'I' | 'q' | 'Q' | 'r'), Some(d)) => is_percent_delimiter(d),
            (Some(d), _) => is_percent_delimiter(d),
            _ => false,
        }
    }

    fn lex_percent(&mut self) -> DslResult<()> {
        let line = self.line;
        self.pos += 1;
        let kind = match self.peek(0) {
            Some(k @ ('w' | 'W' | 'i' | 'I' | 'q' | 'Q' | 'r')) => {
                self.pos += 1;
                k
            }
            _ => 'Q',
        };
        let open = self.peek(0).unwrap_or_default();
        self.pos += 1;
        let close = closing_delimiter(open);
        let nested = (close != open).then_some(open);
        let body = self.read_delimited(close, nested, kind == 'r')?;

        match kind {
            'w' | 'W' | 'i' | 'I' => {
                let words = body.split_whitespace().map(str::to_string).collect();
                self.push(
                    Tok::Words {
                        symbols: matches!(kind, 'i' | 'I'),
                        words,
                    },
                    line,
                );
            }
            'r' => {
                self.skip_regex_flags();
                self.push(Tok::Regex(format!("%r{}{}{}", open, body, close)), line);
            }
            _ => self.push(Tok::Str(body), line),
        }
        Ok(())
    }

    /// Raw text up to an unescaped `close`, honouring nesting of `open`.
    fn read_delimited(&mut self, close: char, open: Option<char>, keep_escapes: bool) -> DslResult<String> {
        let start = self.line;
        let mut depth = 0usize;
        let mut text = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return self.error(start, "unterminated literal");
            };
            self.pos += 1;
            match c {
                '\\' => {
                    if let Some(next) = self.peek(0) {
                        if keep_escapes || next != close {
                            text.push('\\');
                        }
                        text.push(next);
                        if next == '\n' {
                            self.line += 1;
                        }
                        self.pos += 1;
                    }
                }
                '\n' => {
                    self.line += 1;
                    text.push(c);
                }
                c if Some(c) == open => {
                    depth += 1;
                    text.push(c);
                }
                c if c == close => {
                    if depth == 0 {
                        return Ok(text);
                    }
                    depth -= 1;
                    text.push(c);
                }
                c => text.push(c),
            }
        }
    }

    fn read_single_quoted(&mut self, quote: char) -> DslResult<String> {
        let start = self.line;
        let mut text = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return self.error(start, "unterminated string");
            };
            self.pos += 1;
            match c {
                '\\' if matches!(self.peek(0), Some(n) if n == quote || n == '\\') => {
                    if let Some(next) = self.peek(0) {
                        text.push(next);
                    }
                    self.pos += 1;
                }
                c if c == quote => return Ok(text),
                '\n' => {
                    self.line += 1;
                    text.push(c);
                }
                c => text.push(c),
            }
        }
    }

    /// Double-quoted text. Interpolations are kept verbatim as `#{...}`.
    fn read_interpolated(&mut self, quote: char) -> DslResult<String> {
        let start = self.line;
        let mut text = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return self.error(start, "unterminated string");
            };
            self.pos += 1;
            match c {
                '\\' => {
                    let Some(next) = self.peek(0) else {
                        return self.error(start, "unterminated string");
                    };
                    self.pos += 1;
                    match next {
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        '\n' => self.line += 1,
                        other => text.push(other),
                    }
                }
                '#' if self.peek(0) == Some('{') => {
                    self.pos += 1;
                    text.push_str("#{");
                    self.read_interpolation(&mut text, start)?;
                }
                '\n' => {
                    self.line += 1;
                    text.push(c);
                }
                c if c == quote => return Ok(text),
                c => text.push(c),
            }
        }
    }

    fn read_interpolation(&mut self, text: &mut String, start: usize) -> DslResult<()> {
        let mut depth = 0usize;
        loop {
            let Some(c) = self.peek(0) else {
                return self.error(start, "unterminated string interpolation");
            };
            self.pos += 1;
            match c {
                '{' => depth += 1,
                '}' if depth == 0 => {
                    text.push('}');
                    return Ok(());
                }
                '}' => depth -= 1,
                '"' | '\'' => {
                    let inner = if c == '"' {
                        self.read_interpolated('"')?
                    } else {
                        self.read_single_quoted('\'')?
                    };
                    text.push(c);
                    text.push_str(&inner);
                    text.push(c);
                    continue;
                }
                '\n' => self.line += 1,
                _ => {}
            }
            text.push(c);
        }
    }

    fn heredoc_ahead(&self) -> bool {
        if self.peek(1) != Some('<') {
            return false;
        }
        let mut offset = 2;
        if matches!(self.peek(offset), Some('~' | '-')) {
            offset += 1;
        }
        match self.peek(offset) {
            Some('"' | '\'') => true,
            Some(c) => c.is_ascii_uppercase() || c == '_',
            None => false,
        }
    }

    fn lex_heredoc_start(&mut self) {
        let line = self.line;
        self.pos += 2;
        let mut squiggly = false;
        let mut indented_end = false;
        match self.peek(0) {
            Some('~') => {
                squiggly = true;
                indented_end = true;
                self.pos += 1;
            }
            Some('-') => {
                indented_end = true;
                self.pos += 1;
            }
            _ => {}
        }
        let terminator = match self.peek(0) {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek(0).is_some_and(|c| c != q && c != '\n') {
                    self.pos += 1;
                }
                let word: String = self.chars[start..self.pos].iter().collect();
                if self.peek(0) == Some(q) {
                    self.pos += 1;
                }
                word
            }
            _ => self.read_identifier(),
        };

        self.pending.push(PendingHeredoc {
            token_index: self.tokens.len(),
            terminator,
            squiggly,
            indented_end,
            line,
        });
        self.push(Tok::Str(String::new()), line);
    }

    fn read_heredoc_bodies(&mut self) -> DslResult<()> {
        for pending in std::mem::take(&mut self.pending) {
            let mut lines: Vec<String> = Vec::new();
            loop {
                if self.pos >= self.chars.len() {
                    return self.error(
                        pending.line,
                        format!("unterminated heredoc, missing {}", pending.terminator),
                    );
                }
                let end = self.chars[self.pos..]
                    .iter()
                    .position(|&c| c == '\n')
                    .map_or(self.chars.len(), |i| self.pos + i);
                let line: String = self.chars[self.pos..end].iter().collect();
                self.pos = (end + 1).min(self.chars.len());
                self.line += 1;

                let is_end = if pending.indented_end {
                    line.trim() == pending.terminator
                } else {
                    line.trim_end_matches('\r') == pending.terminator
                };
                if is_end {
                    break;
                }
                lines.push(line);
            }

            if pending.squiggly {
                let indent = lines
                    .iter()
                    .filter(|l| !l.trim().is_empty())
                    .map(|l| l.len() - l.trim_start().len())
                    .min()
                    .unwrap_or(0);
                for line in &mut lines {
                    *line = line.get(indent..).unwrap_or("").to_string();
                }
            }

            let mut body = lines.join("\n");
            if !lines.is_empty() {
                body.push('\n');
            }
            if let Some(token) = self.tokens.get_mut(pending.token_index) {
                token.tok = Tok::Str(body);
            }
        }
        Ok(())
    }

    fn char_literal_ahead(&self) -> bool {
        self.space_before
            && self.peek(1).is_some_and(|c| c.is_alphanumeric())
            && !self.peek(2).is_some_and(|c| c.is_alphanumeric() || c == '_')
    }
}

fn is_percent_delimiter(c: char) -> bool {
    matches!(c, '(' | '[' | '{' | '<' | '|' | '!' | '/')
}

fn closing_delimiter(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        '{' => '}',
        '<' => '>',
        other => other,
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

enum Close {
    /// `end` or one of the given section keywords.
    Keywords(&'static [&'static str]),
    /// `}` of a brace block.
    Brace,
    /// End of input.
    Eof,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset).map(|t| &t.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn space_before(&self) -> bool {
        self.tokens.get(self.pos).is_some_and(|t| t.space_before)
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        self.pos += 1;
        tok
    }

    fn error<T>(&self, message: impl Into<String>) -> DslResult<T> {
        Err(DslError {
            line: self.line(),
            message: message.into(),
        })
    }

    fn is_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(w)) if w == word)
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Some(Tok::Newline)) {
            self.pos += 1;
        }
    }

    fn parse_document(&mut self) -> DslResult<Vec<Statement>> {
        let (statements, _) = self.parse_body(Close::Eof)?;
        Ok(statements)
    }

    /// Statements up to a closing token. Returns the keyword that closed the body.
    fn parse_body(&mut self, close: Close) -> DslResult<(Vec<Statement>, String)> {
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            match (self.peek(), &close) {
                (None, Close::Eof) => return Ok((statements, String::new())),
                (None, Close::Brace) => return self.error("missing `}`"),
                (None, Close::Keywords(_)) => return self.error("missing `end`"),
                (Some(Tok::Punct('}')), Close::Brace) => {
                    self.pos += 1;
                    return Ok((statements, "}".to_string()));
                }
                (Some(Tok::Ident(word)), Close::Keywords(words))
                    if word == "end" || words.contains(&word.as_str()) =>
                {
                    let word = word.clone();
                    self.pos += 1;
                    return Ok((statements, word));
                }
                (Some(Tok::Ident(word)), _) if word == "end" => {
                    return self.error("unexpected `end`");
                }
                (Some(Tok::Punct(c @ (')' | ']' | '}'))), _) => {
                    return self.error(format!("unexpected `{}`", c));
                }
                _ => statements.push(self.parse_statement()?),
            }
        }
    }

    /// Body of a `do`/`def` block, up to its `end`. `rescue`/`ensure`/`else`
    /// sections are parsed for balance and dropped.
    fn parse_block_body(&mut self) -> DslResult<Vec<Statement>> {
        const SECTIONS: &[&str] = &["rescue", "ensure", "else"];
        let (body, mut closed_by) = self.parse_body(Close::Keywords(SECTIONS))?;
        while closed_by != "end" {
            let (_, next) = self.parse_body(Close::Keywords(SECTIONS))?;
            closed_by = next;
        }
        Ok(body)
    }

    fn parse_statement(&mut self) -> DslResult<Statement> {
        let line = self.line();
        let kind = match self.peek().cloned() {
            Some(Tok::Ident(word)) => match word.as_str() {
                "class" => self.parse_class()?,
                "module" => self.parse_module()?,
                "def" => self.parse_def()?,
                "if" | "unless" => self.parse_if(word == "unless")?,
                "case" => self.parse_case()?,
                "begin" => {
                    self.pos += 1;
                    let body = self.parse_block_body()?;
                    self.skip_line()?;
                    StatementKind::Group(body)
                }
                "while" | "until" | "for" => {
                    self.pos += 1;
                    let text = format!("{} {}", word, self.skip_line()?);
                    self.parse_body(Close::Keywords(&[]))?;
                    self.skip_line()?;
                    StatementKind::Other(text)
                }
                _ => self.parse_call_or_expression()?,
            },
            Some(Tok::Const(_) | Tok::Op("::")) => self.parse_call_or_expression()?,
            Some(_) => {
                let start = self.pos;
                let value = self.parse_value()?;
                if self.at_line_end() && !matches!(value, Literal::Expr(_)) {
                    StatementKind::Literal(value)
                } else {
                    self.pos = start;
                    StatementKind::Other(self.skip_line()?)
                }
            }
            None => return self.error("unexpected end of file"),
        };
        Ok(Statement { line, kind })
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek(), None | Some(Tok::Newline))
    }

    fn parse_const_path(&mut self) -> DslResult<String> {
        let mut name = String::new();
        loop {
            match self.peek().cloned() {
                Some(Tok::Op("::")) => {
                    self.pos += 1;
                    name.push_str("::");
                }
                Some(Tok::Const(part)) => {
                    self.pos += 1;
                    name.push_str(&part);
                    if !matches!(self.peek(), Some(Tok::Op("::"))) {
                        return Ok(name);
                    }
                }
                _ => return self.error("expected a constant name"),
            }
        }
    }

    fn parse_class(&mut self) -> DslResult<StatementKind> {
        self.pos += 1;
        if matches!(self.peek(), Some(Tok::Op("<<"))) {
            let text = format!("class {}", self.skip_line()?);
            self.parse_block_body()?;
            self.skip_line()?;
            return Ok(StatementKind::Other(text));
        }
        let name = self.parse_const_path()?;
        let superclass = if matches!(self.peek(), Some(Tok::Punct('<'))) {
            self.pos += 1;
            Some(self.skip_line()?)
        } else {
            self.skip_line()?;
            None
        };
        let body = self.parse_block_body()?;
        self.skip_line()?;
        Ok(StatementKind::Class {
            name,
            superclass,
            body,
        })
    }

    fn parse_module(&mut self) -> DslResult<StatementKind> {
        self.pos += 1;
        let name = self.parse_const_path()?;
        self.skip_line()?;
        let body = self.parse_block_body()?;
        self.skip_line()?;
        Ok(StatementKind::Module { name, body })
    }

    fn parse_def(&mut self) -> DslResult<StatementKind> {
        self.pos += 1;
        let header = self.skip_line_tokens()?;
        let name = header
            .iter()
            .take_while(|tok| !matches!(tok, Tok::Punct('(')))
            .map(render)
            .collect::<Vec<_>>()
            .join("");
        let name = name.trim_start_matches("self.").to_string();

        // Endless `def name = expr`. Default arguments sit inside the parens.
        let mut depth = 0usize;
        let endless = header.iter().any(|tok| match tok {
            Tok::Punct('(') => {
                depth += 1;
                false
            }
            Tok::Punct(')') => {
                depth = depth.saturating_sub(1);
                false
            }
            Tok::Punct('=') => depth == 0,
            _ => false,
        });
        if endless {
            return Ok(StatementKind::Def {
                name,
                body: Vec::new(),
            });
        }

        let body = self.parse_block_body()?;
        self.skip_line()?;
        Ok(StatementKind::Def { name, body })
    }

    fn parse_if(&mut self, negated: bool) -> DslResult<StatementKind> {
        self.pos += 1;
        let mut branches = Vec::new();
        let mut condition = Some(Condition {
            negated,
            text: self.read_condition()?,
        });
        loop {
            let (body, closed_by) = self.parse_body(Close::Keywords(&["elsif", "else"]))?;
            branches.push(Branch { condition, body });
            match closed_by.as_str() {
                "elsif" => {
                    condition = Some(Condition {
                        negated: false,
                        text: self.read_condition()?,
                    });
                }
                "else" => condition = None,
                _ => break,
            }
        }
        self.skip_line()?;
        Ok(StatementKind::Conditional(branches))
    }

    fn parse_case(&mut self) -> DslResult<StatementKind> {
        self.pos += 1;
        let subject = self.read_condition()?;
        let mut branches = Vec::new();
        // Anything before the first `when` is not executed.
        let (_, mut closed_by) = self.parse_body(Close::Keywords(&["when", "in", "else"]))?;
        while closed_by != "end" {
            let condition = match closed_by.as_str() {
                "else" => None,
                _ => Some(Condition {
                    negated: false,
                    text: format!("case {} when {}", subject, self.read_condition()?),
                }),
            };
            let (body, next) = self.parse_body(Close::Keywords(&["when", "in", "else"]))?;
            branches.push(Branch { condition, body });
            closed_by = next;
        }
        self.skip_line()?;
        Ok(StatementKind::Conditional(branches))
    }

    /// Condition text up to the end of the line or `then`.
    fn read_condition(&mut self) -> DslResult<String> {
        let mut parts = Vec::new();
        let mut depth = 0usize;
        while let Some(tok) = self.peek().cloned() {
            match &tok {
                Tok::Newline if depth == 0 => break,
                Tok::Ident(word) if depth == 0 && word == "then" => {
                    self.pos += 1;
                    break;
                }
                Tok::Punct('(' | '[' | '{') => depth += 1,
                Tok::Punct(')' | ']' | '}') => {
                    if depth == 0 {
                        return self.error("unbalanced bracket in condition");
                    }
                    depth -= 1;
                }
                _ => {}
            }
            parts.push(self.render_current());
            self.pos += 1;
        }
        Ok(join_rendered(parts))
    }

    fn render_current(&self) -> (bool, String) {
        let token = &self.tokens[self.pos];
        (token.space_before, render(&token.tok))
    }

    fn parse_call_or_expression(&mut self) -> DslResult<StatementKind> {
        let start = self.pos;

        // Receiver chain: `a.b(c).d`, `Foo::Bar.baz`.
        let mut segments: Vec<String> = Vec::new();
        let mut paren_args: Option<(Vec<Literal>, Vec<(String, Literal)>)>;
        loop {
            let name = match self.advance() {
                Some(Tok::Ident(name) | Tok::Const(name)) => name,
                Some(Tok::Op("::")) => continue,
                _ => {
                    self.pos = start;
                    return Ok(StatementKind::Other(self.skip_line()?));
                }
            };
            paren_args = None;
            if matches!(self.peek(), Some(Tok::Punct('('))) && !self.space_before() {
                self.pos += 1;
                paren_args = Some(self.parse_args(true)?);
            }
            if matches!(self.peek(), Some(Tok::Punct('[')))
                && !self.space_before()
                && paren_args.is_none()
            {
                // Indexing (`Formula["foo"]`, `ENV["X"]`): not a call we model.
                self.pos = start;
                return Ok(StatementKind::Other(self.skip_line()?));
            }
            segments.push(name);
            let continues = matches!(self.peek(), Some(Tok::Punct('.') | Tok::Op("::" | "&.")))
                && matches!(self.peek_at(1), Some(Tok::Ident(_) | Tok::Const(_)));
            if continues {
                self.pos += 1;
            } else {
                break;
            }
        }

        // Assignment or operator expression.
        if matches!(
            self.peek(),
            Some(Tok::Punct('=') | Tok::Op("+=" | "-=" | "||=" | "<<" | "==" | "=~"))
        ) {
            self.pos = start;
            return Ok(StatementKind::Other(self.skip_line()?));
        }

        let method = segments.pop().unwrap_or_default();
        let receiver = (!segments.is_empty()).then(|| segments.join("."));

        let (args, kwargs) = match paren_args {
            Some(parsed) => parsed,
            None if self.args_follow() => self.parse_args(false)?,
            None => (Vec::new(), Vec::new()),
        };

        let block = match self.peek() {
            Some(Tok::Ident(word)) if word == "do" => {
                self.pos += 1;
                self.skip_block_params();
                Some(self.parse_block_body()?)
            }
            Some(Tok::Punct('{')) => {
                self.pos += 1;
                self.skip_block_params();
                Some(self.parse_body(Close::Brace)?.0)
            }
            _ => None,
        };

        let modifier = match self.peek() {
            Some(Tok::Ident(word)) if word == "if" || word == "unless" => {
                let negated = word == "unless";
                self.pos += 1;
                Some(Condition {
                    negated,
                    text: self.skip_line()?,
                })
            }
            _ => None,
        };

        if !self.at_line_end() {
            let rest = self.skip_line()?;
            tracing::trace!("ignoring trailing `{}` after {}", rest, method);
        }

        Ok(StatementKind::Call(Call {
            receiver,
            method,
            args,
            kwargs,
            block,
            modifier,
        }))
    }

    /// Whether unparenthesised arguments follow a method name.
    fn args_follow(&self) -> bool {
        if !self.space_before() {
            return false;
        }
        match self.peek() {
            None | Some(Tok::Newline | Tok::Arrow) => false,
            Some(Tok::Ident(word)) => !matches!(
                word.as_str(),
                "do" | "if" | "unless" | "and" | "or" | "then" | "rescue" | "end"
            ),
            Some(Tok::Punct(c)) => matches!(c, '[' | '(' | '*' | '&' | '!' | '-' | ':'),
            Some(Tok::Op(op)) => *op == "::" || *op == "->",
            _ => true,
        }
    }

    fn skip_block_params(&mut self) {
        if matches!(self.peek(), Some(Tok::Punct('|'))) {
            self.pos += 1;
            while let Some(tok) = self.peek() {
                let is_pipe = matches!(tok, Tok::Punct('|'));
                self.pos += 1;
                if is_pipe {
                    break;
                }
            }
        } else if matches!(self.peek(), Some(Tok::Op("||"))) {
            self.pos += 1;
        }
    }

    fn parse_args(&mut self, parenthesised: bool) -> DslResult<(Vec<Literal>, Vec<(String, Literal)>)> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        let mut pairs = Vec::new();

        loop {
            if parenthesised {
                self.skip_newlines();
                if matches!(self.peek(), Some(Tok::Punct(')'))) {
                    self.pos += 1;
                    break;
                }
            } else if self.at_arg_boundary() {
                break;
            }

            if let Some(Tok::Label(key)) = self.peek().cloned() {
                self.pos += 1;
                self.skip_newlines();
                let value = self.parse_value()?;
                kwargs.push((key, value));
            } else {
                let value = self.parse_value()?;
                if matches!(self.peek(), Some(Tok::Arrow)) {
                    self.pos += 1;
                    self.skip_newlines();
                    let mapped = self.parse_value()?;
                    pairs.push((value, mapped));
                } else {
                    args.push(value);
                }
            }

            match self.peek() {
                Some(Tok::Punct(',')) => {
                    self.pos += 1;
                    self.skip_newlines();
                }
                Some(Tok::Punct(')')) if parenthesised => {}
                Some(Tok::Newline) if parenthesised => {}
                _ if parenthesised => return self.error("expected `,` or `)` in arguments"),
                _ => break,
            }
        }

        if !pairs.is_empty() {
            args.push(Literal::Hash(pairs));
        }
        Ok((args, kwargs))
    }

    fn at_arg_boundary(&self) -> bool {
        match self.peek() {
            None | Some(Tok::Newline) => true,
            Some(Tok::Ident(word)) => matches!(word.as_str(), "do" | "if" | "unless"),
            Some(Tok::Punct('{')) => true,
            _ => false,
        }
    }

    /// One argument value: a literal, or the source text of an expression.
    fn parse_value(&mut self) -> DslResult<Literal> {
        let start = self.pos;
        let literal = match self.peek().cloned() {
            Some(Tok::Str(mut text)) => {
                self.pos += 1;
                // Adjacent string literals concatenate.
                while let Some(Tok::Str(more)) = self.peek().cloned() {
                    self.pos += 1;
                    text.push_str(&more);
                }
                Some(Literal::Str(text))
            }
            Some(Tok::Sym(name)) => {
                self.pos += 1;
                Some(Literal::Sym(name))
            }
            Some(Tok::Num(text)) => {
                self.pos += 1;
                text.parse().ok().map(Literal::Int)
            }
            Some(Tok::Ident(word)) if matches!(word.as_str(), "true" | "false" | "nil") => {
                self.pos += 1;
                Some(match word.as_str() {
                    "true" => Literal::Bool(true),
                    "false" => Literal::Bool(false),
                    _ => Literal::Nil,
                })
            }
            Some(Tok::Words { symbols, words }) => {
                self.pos += 1;
                Some(Literal::Array(
                    words
                        .into_iter()
                        .map(|w| if symbols { Literal::Sym(w) } else { Literal::Str(w) })
                        .collect(),
                ))
            }
            Some(Tok::Punct('[')) => {
                self.pos += 1;
                Some(self.parse_array()?)
            }
            Some(Tok::Punct('{')) => {
                self.pos += 1;
                Some(self.parse_hash()?)
            }
            _ => None,
        };

        match literal {
            Some(literal) if self.at_value_boundary() => Ok(literal),
            _ => {
                self.pos = start;
                Ok(Literal::Expr(self.read_expression()?))
            }
        }
    }

    fn at_value_boundary(&self) -> bool {
        match self.peek() {
            None | Some(Tok::Newline | Tok::Arrow) => true,
            Some(Tok::Punct(',' | ')' | ']' | '}')) => true,
            Some(Tok::Ident(word)) => matches!(word.as_str(), "do" | "if" | "unless" | "then"),
            _ => false,
        }
    }

    fn parse_array(&mut self) -> DslResult<Literal> {
        let mut items = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Some(Tok::Punct(']')) => {
                    self.pos += 1;
                    return Ok(Literal::Array(items));
                }
                None => return self.error("missing `]`"),
                _ => {}
            }
            items.push(self.parse_value()?);
            self.skip_newlines();
            match self.peek() {
                Some(Tok::Punct(',')) => self.pos += 1,
                Some(Tok::Punct(']')) => {}
                _ => return self.error("expected `,` or `]` in array"),
            }
        }
    }

    fn parse_hash(&mut self) -> DslResult<Literal> {
        let mut entries = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek().cloned() {
                Some(Tok::Punct('}')) => {
                    self.pos += 1;
                    return Ok(Literal::Hash(entries));
                }
                None => return self.error("missing `}`"),
                Some(Tok::Label(key)) => {
                    self.pos += 1;
                    self.skip_newlines();
                    let value = self.parse_value()?;
                    entries.push((Literal::Sym(key), value));
                }
                _ => {
                    let key = self.parse_value()?;
                    if !matches!(self.peek(), Some(Tok::Arrow)) {
                        return self.error("expected `=>` in hash");
                    }
                    self.pos += 1;
                    self.skip_newlines();
                    let value = self.parse_value()?;
                    entries.push((key, value));
                }
            }
            self.skip_newlines();
            match self.peek() {
                Some(Tok::Punct(',')) => self.pos += 1,
                Some(Tok::Punct('}')) => {}
                _ => return self.error("expected `,` or `}` in hash"),
            }
        }
    }

    /// Source text of an expression, up to a `,`/`=>`/closing bracket at depth zero.
    fn read_expression(&mut self) -> DslResult<String> {
        let mut parts = Vec::new();
        let mut depth = 0usize;
        while let Some(tok) = self.peek().cloned() {
            match &tok {
                Tok::Newline if depth == 0 => break,
                Tok::Newline => {
                    self.pos += 1;
                    continue;
                }
                Tok::Punct(',' | ')' | ']' | '}') | Tok::Arrow if depth == 0 => break,
                Tok::Ident(word) if depth == 0 && matches!(word.as_str(), "if" | "unless" | "then") => {
                    break;
                }
                Tok::Ident(word) if word == "do" => {
                    if depth == 0 {
                        break;
                    }
                    self.pos += 1;
                    self.skip_block_params();
                    self.parse_block_body()?;
                    parts.push((true, "do ... end".to_string()));
                    continue;
                }
                Tok::Punct('(' | '[' | '{') => depth += 1,
                Tok::Punct(')' | ']' | '}') => depth -= 1,
                _ => {}
            }
            parts.push(self.render_current());
            self.pos += 1;
        }
        if parts.is_empty() {
            return self.error("expected a value");
        }
        Ok(join_rendered(parts))
    }

    /// Consume the rest of the logical line, including any blocks it opens.
    fn skip_line(&mut self) -> DslResult<String> {
        let mut parts = Vec::new();
        let mut depth = 0usize;
        let mut previous: Option<Tok> = None;
        while let Some(tok) = self.peek().cloned() {
            match &tok {
                Tok::Newline if depth == 0 => break,
                Tok::Newline => {}
                Tok::Ident(word) if word == "do" => {
                    self.pos += 1;
                    self.skip_block_params();
                    self.parse_block_body()?;
                    parts.push((true, "do ... end".to_string()));
                    previous = None;
                    continue;
                }
                Tok::Ident(word)
                    if BLOCK_KEYWORDS.contains(&word.as_str())
                        && word != "def"
                        && matches!(previous, None | Some(Tok::Punct('=' | '(')) | Some(Tok::Op(_))) =>
                {
                    // `x = if cond ... end`, `x = case y ... end`.
                    self.parse_statement()?;
                    parts.push((true, format!("{} ... end", word)));
                    previous = None;
                    continue;
                }
                Tok::Punct('(' | '[' | '{') => depth += 1,
                // Closer of an enclosing brace block or argument list.
                Tok::Punct(')' | ']' | '}') if depth == 0 => break,
                Tok::Punct(')' | ']' | '}') => depth -= 1,
                _ => {}
            }
            if !matches!(tok, Tok::Newline) {
                parts.push(self.render_current());
            }
            previous = Some(tok);
            self.pos += 1;
        }
        if depth > 0 {
            return self.error("unbalanced brackets");
        }
        Ok(join_rendered(parts))
    }

    /// Tokens of the rest of the line, without interpretation.
    fn skip_line_tokens(&mut self) -> DslResult<Vec<Tok>> {
        let mut tokens = Vec::new();
        let mut depth = 0usize;
        while let Some(tok) = self.peek().cloned() {
            match &tok {
                Tok::Newline if depth == 0 => break,
                Tok::Punct('(') => depth += 1,
                Tok::Punct(')') => depth = depth.saturating_sub(1),
                _ => {}
            }
            tokens.push(tok);
            self.pos += 1;
        }
        Ok(tokens)
    }
}

fn render(tok: &Tok) -> String {
    match tok {
        Tok::Ident(s) | Tok::Const(s) | Tok::Num(s) | Tok::Regex(s) => s.clone(),
        Tok::Str(s) => format!("{:?}", s),
        Tok::Sym(s) => format!(":{}", s),
        Tok::Label(s) => format!("{}:", s),
        Tok::Words { symbols, words } => {
            format!("%{}[{}]", if *symbols { 'i' } else { 'w' }, words.join(" "))
        }
        Tok::Arrow => "=>".to_string(),
        Tok::Punct(c) => c.to_string(),
        Tok::Op(op) => op.to_string(),
        Tok::Newline => "\n".to_string(),
    }
}

fn join_rendered(parts: Vec<(bool, String)>) -> String {
    let mut text = String::new();
    for (space_before, part) in parts {
        if space_before && !text.is_empty() {
            text.push(' ');
        }
        text.push_str(&part);
    }
    text
}
