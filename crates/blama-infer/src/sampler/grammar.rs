//! GBNF grammar constraint.
//!
//! Parses a BNF-styled grammar (rules `name ::= body`, string literals,
//! character classes, grouping, alternation, and `*`/`+`/`?` repetition)
//! into flat element lists, then constrains sampling by advancing pushdown
//! stacks over each candidate token's text. A candidate survives iff some
//! stack accepts every character of its piece; end-of-generation tokens
//! survive iff some stack has fully completed.

use std::collections::HashMap;

use blama_engine::{BlamaError, Result};

/// One grammar element. A rule body is a flat list: sequences separated by
/// `Alt`, terminated by `End`. Character classes are a head element
/// (`Char`/`CharNot`) optionally extended by `CharRngUpper` (range upper
/// bound for the preceding char) and `CharAlt` (additional class member).
#[derive(Debug, Clone, Copy, PartialEq)]
enum El {
    End,
    Alt,
    RuleRef(u32),
    Char(char),
    CharNot(char),
    CharRngUpper(char),
    CharAlt(char),
}

/// A compiled grammar: rule bodies indexed by rule id.
#[derive(Debug, Clone)]
pub struct Grammar {
    rules: Vec<Vec<El>>,
    root: u32,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Parser {
    chars: Vec<char>,
    pos: usize,
    rules: Vec<Vec<El>>,
    ids: HashMap<String, u32>,
}

fn cfg_err(msg: impl Into<String>) -> BlamaError {
    BlamaError::Config(msg.into())
}

impl Parser {
    fn new(text: &str) -> Self {
        Parser {
            chars: text.chars().collect(),
            pos: 0,
            rules: Vec::new(),
            ids: HashMap::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self, newlines: bool) {
        loop {
            match self.peek() {
                Some('#') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('\n') | Some('\r') if newlines => {
                    self.pos += 1;
                }
                Some(c) if c == ' ' || c == '\t' => {
                    self.pos += 1;
                }
                _ => break,
            }
        }
    }

    fn is_ident_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '-' || c == '_'
    }

    fn ident(&mut self) -> Option<String> {
        let start = self.pos;
        while self.peek().map(Self::is_ident_char).unwrap_or(false) {
            self.pos += 1;
        }
        if self.pos > start {
            Some(self.chars[start..self.pos].iter().collect())
        } else {
            None
        }
    }

    fn rule_id(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.rules.len() as u32;
        self.ids.insert(name.to_string(), id);
        self.rules.push(Vec::new());
        id
    }

    fn fresh_rule(&mut self) -> u32 {
        let id = self.rules.len() as u32;
        self.rules.push(Vec::new());
        id
    }

    /// After a newline: does a `name ::=` rule header follow?
    fn at_rule_header(&self) -> bool {
        let mut p = self.pos;
        while p < self.chars.len() && (self.chars[p] == ' ' || self.chars[p] == '\t') {
            p += 1;
        }
        let start = p;
        while p < self.chars.len() && Self::is_ident_char(self.chars[p]) {
            p += 1;
        }
        if p == start {
            return false;
        }
        while p < self.chars.len() && (self.chars[p] == ' ' || self.chars[p] == '\t') {
            p += 1;
        }
        self.chars[p..].starts_with(&[':', ':', '='])
    }

    fn escape(&mut self) -> Result<char> {
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('\\') => Ok('\\'),
            Some('"') => Ok('"'),
            Some('\'') => Ok('\''),
            Some('[') => Ok('['),
            Some(']') => Ok(']'),
            Some('x') => {
                let hi = self.bump().ok_or_else(|| cfg_err("truncated \\x escape"))?;
                let lo = self.bump().ok_or_else(|| cfg_err("truncated \\x escape"))?;
                let v = u32::from_str_radix(&format!("{hi}{lo}"), 16)
                    .map_err(|_| cfg_err("bad \\x escape in grammar"))?;
                char::from_u32(v).ok_or_else(|| cfg_err("bad \\x escape in grammar"))
            }
            other => Err(cfg_err(format!("bad escape {other:?} in grammar"))),
        }
    }

    fn parse_rule(&mut self) -> Result<()> {
        let name = self
            .ident()
            .ok_or_else(|| cfg_err("expected rule name in grammar"))?;
        self.skip_ws(false);
        if self.bump() != Some(':') || self.bump() != Some(':') || self.bump() != Some('=') {
            return Err(cfg_err(format!("expected ::= after rule name {name}")));
        }
        let id = self.rule_id(&name);
        let mut body = Vec::new();
        self.parse_alternates(&mut body, true)?;
        body.push(El::End);
        self.rules[id as usize] = body;
        Ok(())
    }

    fn parse_alternates(&mut self, out: &mut Vec<El>, top_level: bool) -> Result<()> {
        self.parse_sequence(out, top_level)?;
        loop {
            self.skip_ws(!top_level);
            if top_level {
                // newlines end a top-level rule unless a | continues it
                let save = self.pos;
                self.skip_ws(true);
                if self.peek() != Some('|') {
                    self.pos = save;
                    break;
                }
            }
            if self.peek() == Some('|') {
                self.pos += 1;
                out.push(El::Alt);
                self.parse_sequence(out, top_level)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn parse_sequence(&mut self, out: &mut Vec<El>, top_level: bool) -> Result<()> {
        let mut last_sym_start = out.len();
        loop {
            self.skip_ws(false);
            if top_level && matches!(self.peek(), Some('\n') | Some('\r')) {
                let save = self.pos;
                self.skip_ws(true);
                if self.at_rule_header() || self.peek().is_none() || self.peek() == Some('|') {
                    self.pos = save;
                    return Ok(());
                }
                // rule continues on the next line
            }
            match self.peek() {
                None | Some('|') | Some(')') => return Ok(()),
                Some('"') => {
                    self.pos += 1;
                    last_sym_start = out.len();
                    loop {
                        match self.bump() {
                            None => return Err(cfg_err("unterminated string in grammar")),
                            Some('"') => break,
                            Some('\\') => out.push(El::Char(self.escape()?)),
                            Some(c) => out.push(El::Char(c)),
                        }
                    }
                }
                Some('[') => {
                    self.pos += 1;
                    last_sym_start = out.len();
                    self.parse_char_class(out)?;
                }
                Some('(') => {
                    self.pos += 1;
                    let sub = self.fresh_rule();
                    let mut body = Vec::new();
                    self.parse_alternates(&mut body, false)?;
                    body.push(El::End);
                    self.rules[sub as usize] = body;
                    self.skip_ws(true);
                    if self.bump() != Some(')') {
                        return Err(cfg_err("expected ) in grammar"));
                    }
                    last_sym_start = out.len();
                    out.push(El::RuleRef(sub));
                }
                Some(c) if c == '*' || c == '+' || c == '?' => {
                    self.pos += 1;
                    if last_sym_start == out.len() {
                        return Err(cfg_err(format!("{c} with no preceding symbol in grammar")));
                    }
                    let sym: Vec<El> = out.drain(last_sym_start..).collect();
                    let sub = self.fresh_rule();
                    let mut body = sym.clone();
                    match c {
                        '*' => {
                            // S' ::= S S' |
                            body.push(El::RuleRef(sub));
                            body.push(El::Alt);
                        }
                        '+' => {
                            // S' ::= S S' | S
                            body.push(El::RuleRef(sub));
                            body.push(El::Alt);
                            body.extend(sym.iter().copied());
                        }
                        _ => {
                            // S' ::= S |
                            body.push(El::Alt);
                        }
                    }
                    body.push(El::End);
                    self.rules[sub as usize] = body;
                    out.push(El::RuleRef(sub));
                    last_sym_start = out.len() - 1;
                }
                Some(c) if Self::is_ident_char(c) => {
                    let name = self.ident().expect("ident_char peeked");
                    let id = self.rule_id(&name);
                    last_sym_start = out.len();
                    out.push(El::RuleRef(id));
                }
                Some(other) => {
                    return Err(cfg_err(format!("unexpected {other:?} in grammar")));
                }
            }
        }
    }

    fn parse_char_class(&mut self, out: &mut Vec<El>) -> Result<()> {
        let negated = if self.peek() == Some('^') {
            self.pos += 1;
            true
        } else {
            false
        };
        let mut first = true;
        loop {
            let c = match self.bump() {
                None => return Err(cfg_err("unterminated character class in grammar")),
                Some(']') => break,
                Some('\\') => self.escape()?,
                Some(c) => c,
            };
            if first {
                out.push(if negated { El::CharNot(c) } else { El::Char(c) });
                first = false;
            } else {
                out.push(El::CharAlt(c));
            }
            if self.peek() == Some('-') && self.chars.get(self.pos + 1) != Some(&']') {
                self.pos += 1;
                let upper = match self.bump() {
                    None => return Err(cfg_err("unterminated character class in grammar")),
                    Some('\\') => self.escape()?,
                    Some(c) => c,
                };
                out.push(El::CharRngUpper(upper));
            }
        }
        if first {
            return Err(cfg_err("empty character class in grammar"));
        }
        Ok(())
    }
}

impl Grammar {
    /// Parse GBNF text. The grammar must define a `root` rule and every
    /// referenced rule.
    pub fn parse(text: &str) -> Result<Self> {
        let mut p = Parser::new(text);
        loop {
            p.skip_ws(true);
            if p.peek().is_none() {
                break;
            }
            p.parse_rule()?;
        }
        for (name, &id) in &p.ids {
            if p.rules[id as usize].is_empty() {
                return Err(cfg_err(format!("undefined grammar rule {name}")));
            }
        }
        let root = *p
            .ids
            .get("root")
            .ok_or_else(|| cfg_err("grammar has no root rule"))?;
        Ok(Grammar {
            rules: p.rules,
            root,
        })
    }

    fn alt_starts(body: &[El]) -> Vec<usize> {
        let mut out = vec![0];
        for (i, el) in body.iter().enumerate() {
            if *el == El::Alt {
                out.push(i + 1);
            }
        }
        out
    }

    /// Expand a stack until its top is a terminal (or the stack is empty),
    /// collecting every expansion.
    fn advance_stack(&self, stack: Vec<(u32, usize)>, out: &mut Vec<Vec<(u32, usize)>>) {
        let Some(&(r, i)) = stack.last() else {
            if !out.contains(&stack) {
                out.push(stack);
            }
            return;
        };
        match self.rules[r as usize][i] {
            El::RuleRef(id) => {
                let next = i + 1;
                let continues = !matches!(self.rules[r as usize][next], El::End | El::Alt);
                for alt in Self::alt_starts(&self.rules[id as usize]) {
                    let mut new = stack.clone();
                    new.pop();
                    if continues {
                        new.push((r, next));
                    }
                    // empty alternate: nothing to push for this branch
                    if !matches!(self.rules[id as usize][alt], El::End | El::Alt) {
                        new.push((id, alt));
                    }
                    self.advance_stack(new, out);
                }
            }
            El::Char(_) | El::CharNot(_) => {
                if !out.contains(&stack) {
                    out.push(stack);
                }
            }
            // sequence ends are consumed when the preceding terminal matches
            El::End | El::Alt | El::CharRngUpper(_) | El::CharAlt(_) => {
                unreachable!("malformed grammar stack")
            }
        }
    }

    /// Match `ch` against the character-class group at `body[i]`; returns
    /// the element index after the group on success.
    fn match_char(&self, body: &[El], i: usize, ch: char) -> Option<usize> {
        let positive = match body[i] {
            El::Char(_) => true,
            El::CharNot(_) => false,
            _ => return None,
        };

        let mut matched = false;
        let mut base = match body[i] {
            El::Char(c) | El::CharNot(c) => c,
            _ => unreachable!(),
        };
        let mut j = i + 1;
        loop {
            match body.get(j) {
                Some(El::CharRngUpper(upper)) => {
                    if base <= ch && ch <= *upper {
                        matched = true;
                    }
                    j += 1;
                }
                Some(El::CharAlt(c)) => {
                    if ch == base {
                        matched = true;
                    }
                    base = *c;
                    j += 1;
                }
                _ => {
                    if ch == base {
                        matched = true;
                    }
                    break;
                }
            }
        }

        if matched == positive {
            Some(j)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Matching state
// ---------------------------------------------------------------------------

/// Pushdown state advancing over accepted text.
#[derive(Debug, Clone)]
pub struct GrammarState {
    grammar: Grammar,
    stacks: Vec<Vec<(u32, usize)>>,
}

impl GrammarState {
    pub fn new(grammar: Grammar) -> Self {
        let mut stacks = Vec::new();
        let root = grammar.root as usize;
        for alt in Grammar::alt_starts(&grammar.rules[root]) {
            let mut stack = Vec::new();
            if !matches!(grammar.rules[root][alt], El::End | El::Alt) {
                stack.push((grammar.root, alt));
            }
            grammar.advance_stack(stack, &mut stacks);
        }
        GrammarState { grammar, stacks }
    }

    pub fn reset(&mut self) {
        *self = GrammarState::new(self.grammar.clone());
    }

    fn accept_char_stacks(
        &self,
        stacks: &[Vec<(u32, usize)>],
        ch: char,
    ) -> Vec<Vec<(u32, usize)>> {
        let mut out = Vec::new();
        for stack in stacks {
            let Some(&(r, i)) = stack.last() else {
                continue;
            };
            let body = &self.grammar.rules[r as usize];
            if let Some(next) = self.grammar.match_char(body, i, ch) {
                let mut new = stack.clone();
                new.pop();
                if !matches!(body[next], El::End | El::Alt) {
                    new.push((r, next));
                }
                self.grammar.advance_stack(new, &mut out);
            }
        }
        out
    }

    /// Whether `text` can extend the accepted input.
    pub fn allows(&self, text: &str) -> bool {
        let mut stacks = self.stacks.clone();
        for ch in text.chars() {
            stacks = self.accept_char_stacks(&stacks, ch);
            if stacks.is_empty() {
                return false;
            }
        }
        true
    }

    /// Whether generation may legally end here.
    pub fn allows_end(&self) -> bool {
        self.stacks.iter().any(|s| s.is_empty())
    }

    /// Commit `text` as accepted input. Text that the grammar rejects leaves
    /// the state unchanged (the sampler should have filtered it).
    pub fn accept(&mut self, text: &str) {
        let mut stacks = self.stacks.clone();
        for ch in text.chars() {
            stacks = self.accept_char_stacks(&stacks, ch);
            if stacks.is_empty() {
                tracing::warn!("grammar rejected accepted text {text:?}; state unchanged");
                return;
            }
        }
        self.stacks = stacks;
    }
}
