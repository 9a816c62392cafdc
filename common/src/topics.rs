pub const TOPIC_NAMESPACE: &str = "viktak/spiti";

pub const SUBTOPIC_LOG: &str = "log";
pub const SUBTOPIC_HEARTBEAT: &str = "HEARTBEAT";
pub const SUBTOPIC_STATE: &str = "STATE";
pub const SUBTOPIC_RESULT: &str = "RESULT";
pub const SUBTOPIC_COMMAND: &str = "cmnd";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

pub const PWM_CHANNELS: usize = 4;

/// Where an inbound message landed, relative to this node's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic {
    Command,
    Pwm(usize),
}

/// Full topic names for one node, rooted at `viktak/spiti/<topic>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    root: String,
}

impl TopicSet {
    pub fn new(topic: &str) -> Self {
        Self {
            root: format!("{TOPIC_NAMESPACE}/{topic}"),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn log(&self) -> String {
        self.join(SUBTOPIC_LOG)
    }

    pub fn heartbeat(&self) -> String {
        self.join(SUBTOPIC_HEARTBEAT)
    }

    pub fn state(&self) -> String {
        self.join(SUBTOPIC_STATE)
    }

    pub fn result(&self) -> String {
        self.join(SUBTOPIC_RESULT)
    }

    pub fn command(&self) -> String {
        self.join(SUBTOPIC_COMMAND)
    }

    pub fn pwm(&self, channel: usize) -> String {
        format!("{}/{SUBTOPIC_COMMAND}/pwm{channel}", self.root)
    }

    /// Every topic the session subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.command()];
        topics.extend((0..PWM_CHANNELS).map(|channel| self.pwm(channel)));
        topics
    }

    pub fn classify(&self, topic: &str) -> Option<InboundTopic> {
        let rest = topic.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let rest = rest.strip_prefix(SUBTOPIC_COMMAND)?;
        if rest.is_empty() {
            return Some(InboundTopic::Command);
        }
        let index: usize = rest.strip_prefix("/pwm")?.parse().ok()?;
        (index < PWM_CHANNELS).then_some(InboundTopic::Pwm(index))
    }

    fn join(&self, subtopic: &str) -> String {
        format!("{}/{subtopic}", self.root)
    }
}
