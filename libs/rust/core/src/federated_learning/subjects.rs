/// Subject naming on the bus, rooted at a configurable prefix (default `fl`).
#[derive(Clone, Debug)]
pub struct Subjects { prefix: String }

impl Subjects {
    pub fn new(prefix: impl Into<String>) -> Self { Self { prefix: prefix.into() } }

    pub fn round_start(&self) -> String { format!("{}.round.start", self.prefix) }

    /// Wildcard matching every participant update of every round.
    pub fn updates(&self) -> String { format!("{}.round.*.update.*", self.prefix) }

    pub fn update(&self, round_id: &str, participant_id: &str) -> String { format!("{}.round.{round_id}.update.{participant_id}", self.prefix) }

    pub fn model_global(&self) -> String { format!("{}.model.global", self.prefix) }

    pub fn model_latest(&self) -> String { format!("{}.model.latest", self.prefix) }

    pub fn round_complete(&self, round_id: &str) -> String { format!("{}.round.{round_id}.complete", self.prefix) }

    /// Extracts (round_id, participant_id) from an update subject.
    pub fn parse_update<'a>(&self, subject: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = subject.strip_prefix(self.prefix.as_str())?.strip_prefix(".round.")?;
        let mut parts = rest.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(round), Some("update"), Some(participant), None) if !round.is_empty() && !participant.is_empty() => Some((round, participant)),
            _ => None,
        }
    }
}

impl Default for Subjects {
    fn default() -> Self { Self::new("fl") }
}
