use crate::{ClientState, Error, Packet};

/// Where an observability event happened and what it carried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventContext {
    pub site: Option<String>,
    pub pool_index: Option<usize>,
    pub channel: Option<String>,
    pub data: Option<Packet>,
    pub error: Option<Error>,
}

impl EventContext {
    pub fn from_error(error: Error) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn at(site: &str, pool_index: usize) -> Self {
        Self {
            site: Some(site.to_string()),
            pool_index: Some(pool_index),
            ..Self::default()
        }
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn data(mut self, packet: Packet) -> Self {
        self.data = Some(packet);
        self
    }

    pub fn error(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }
}

/// Events the relay reports to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Error(EventContext),
    Subscribe(EventContext),
    SubscribeFail(EventContext),
    Publish(EventContext),
    PublishFail(EventContext),
    UpdateBrokers { sites: Vec<String> },
    UpdateWorkers { workers: Vec<String> },
    StateChanged(ClientState),
}

impl ClientEvent {
    pub fn error(error: Error) -> Self {
        Self::Error(EventContext::from_error(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::Subscribe(_) => "subscribe",
            Self::SubscribeFail(_) => "subscribeFail",
            Self::Publish(_) => "publish",
            Self::PublishFail(_) => "publishFail",
            Self::UpdateBrokers { .. } => "updateBrokers",
            Self::UpdateWorkers { .. } => "updateWorkers",
            Self::StateChanged(_) => "stateChanged",
        }
    }

    pub fn context(&self) -> Option<&EventContext> {
        match self {
            Self::Error(ctx)
            | Self::Subscribe(ctx)
            | Self::SubscribeFail(ctx)
            | Self::Publish(ctx)
            | Self::PublishFail(ctx) => Some(ctx),
            _ => None,
        }
    }
}
