use std::fmt;

/// Longest comment iptables accepts.
pub const MAX_COMMENT_LEN: usize = 256;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule {
    pub match_criteria: MatchCriteria,
    pub action: Action,
    pub comments: Vec<String>,
}

impl Rule {
    pub fn new(match_criteria: MatchCriteria, action: Action) -> Self {
        Self {
            match_criteria,
            action,
            comments: Vec::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comments.push(comment.into());
        self
    }

    pub fn render_append(&self, chain: &str, prefix_fragment: &str) -> String {
        self.render_inner(vec!["-A".to_owned(), chain.to_owned()], prefix_fragment)
    }

    pub fn render_insert(&self, chain: &str, prefix_fragment: &str) -> String {
        self.render_inner(vec!["-I".to_owned(), chain.to_owned()], prefix_fragment)
    }

    pub fn render_insert_at_rule_num(
        &self,
        chain: &str,
        rule_num: usize,
        prefix_fragment: &str,
    ) -> String {
        self.render_inner(
            vec!["-I".to_owned(), chain.to_owned(), rule_num.to_string()],
            prefix_fragment,
        )
    }

    pub fn render_replace(&self, chain: &str, rule_num: usize, prefix_fragment: &str) -> String {
        self.render_inner(
            vec!["-R".to_owned(), chain.to_owned(), rule_num.to_string()],
            prefix_fragment,
        )
    }

    fn render_inner(&self, mut fragments: Vec<String>, prefix_fragment: &str) -> String {
        if !prefix_fragment.is_empty() {
            fragments.push(prefix_fragment.to_owned());
        }
        for comment in &self.comments {
            fragments.push(format!(
                "-m comment --comment \"{}\"",
                escape_comment(comment)
            ));
        }
        let match_fragment = self.match_criteria.render();
        if !match_fragment.is_empty() {
            fragments.push(match_fragment);
        }
        let action_fragment = self.action.to_fragment();
        if !action_fragment.is_empty() {
            fragments.push(action_fragment);
        }
        fragments.join(" ")
    }
}

/// Strips everything but a conservative character set and truncates to
/// [`MAX_COMMENT_LEN`] bytes.
pub fn escape_comment(comment: &str) -> String {
    let mut escaped: String = comment
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || matches!(
                    c,
                    '_' | ' ' | '@' | '%' | '+' | '-' | '=' | ':' | ',' | '.' | '/'
                )
        })
        .collect();
    escaped.truncate(MAX_COMMENT_LEN);
    escaped
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchCriteria(Vec<String>);

impl MatchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&self) -> String {
        self.0.join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(mut self, fragment: String) -> Self {
        self.0.push(fragment);
        self
    }

    pub fn mark_matches_with_mask(self, mark: u32, mask: u32) -> Self {
        self.push(format!("-m mark --mark {mark:#x}/{mask:#x}"))
    }

    pub fn not_mark_matches_with_mask(self, mark: u32, mask: u32) -> Self {
        self.push(format!("-m mark ! --mark {mark:#x}/{mask:#x}"))
    }

    pub fn source_ip_set(self, name: &str) -> Self {
        self.push(format!("-m set --match-set {name} src"))
    }

    pub fn dest_ip_set(self, name: &str) -> Self {
        self.push(format!("-m set --match-set {name} dst"))
    }

    pub fn not_dest_ip_set(self, name: &str) -> Self {
        self.push(format!("-m set ! --match-set {name} dst"))
    }

    pub fn source_net(self, net: &str) -> Self {
        self.push(format!("--source {net}"))
    }

    pub fn dest_net(self, net: &str) -> Self {
        self.push(format!("--destination {net}"))
    }

    pub fn in_interface(self, name: &str) -> Self {
        self.push(format!("--in-interface {name}"))
    }

    pub fn out_interface(self, name: &str) -> Self {
        self.push(format!("--out-interface {name}"))
    }

    pub fn conntrack_state(self, states: &str) -> Self {
        self.push(format!("-m conntrack --ctstate {states}"))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Action {
    #[default]
    Accept,
    Drop,
    Return,
    Jump(String),
    Goto(String),
    SetMaskedMark { mark: u32, mask: u32 },
    Snat { to_source: String },
    Masquerade,
}

impl Action {
    pub fn to_fragment(&self) -> String {
        match self {
            Action::Accept => "--jump ACCEPT".into(),
            Action::Drop => "--jump DROP".into(),
            Action::Return => "--jump RETURN".into(),
            Action::Jump(target) => format!("--jump {target}"),
            Action::Goto(target) => format!("--goto {target}"),
            Action::SetMaskedMark { mark, mask } => {
                format!("--jump MARK --set-mark {mark:#x}/{mask:#x}")
            }
            Action::Snat { to_source } => format!("--jump SNAT --to-source {to_source}"),
            Action::Masquerade => "--jump MASQUERADE".into(),
        }
    }

    /// Chain this action transfers control to, if any.
    pub fn referenced_chain(&self) -> Option<&str> {
        match self {
            Action::Jump(target) | Action::Goto(target) => Some(target),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_fragment())
    }
}
