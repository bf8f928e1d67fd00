//! Device state machine
//!
//! The transition table is data: [`transition`] maps `(state, event)` to the
//! destination state and the entry effects to run on arrival. [`DeviceFsm`]
//! only tracks the current state; executing effects is the session's job.

use std::fmt;

use crate::error::{Result, WellSimError};
use crate::protocol::FunctionCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Initial,
    Unregistered,
    UnregisteredConfirmed,
    Registered,
    PowerOn,
    ValidUser,
    InvalidUser,
    Started,
    NotStartedSwipedCard,
    StartedSwipedCard,
}

impl DeviceState {
    pub const ALL: [DeviceState; 10] = [
        DeviceState::Initial,
        DeviceState::Unregistered,
        DeviceState::UnregisteredConfirmed,
        DeviceState::Registered,
        DeviceState::PowerOn,
        DeviceState::ValidUser,
        DeviceState::InvalidUser,
        DeviceState::Started,
        DeviceState::NotStartedSwipedCard,
        DeviceState::StartedSwipedCard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Initial => "initial",
            DeviceState::Unregistered => "unregistered",
            DeviceState::UnregisteredConfirmed => "unregistered_confirmed",
            DeviceState::Registered => "registered",
            DeviceState::PowerOn => "power_on",
            DeviceState::ValidUser => "valid_user",
            DeviceState::InvalidUser => "invalid_user",
            DeviceState::Started => "started",
            DeviceState::NotStartedSwipedCard => "not_started_swiped_card",
            DeviceState::StartedSwipedCard => "started_swiped_card",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    UnregisteredInit,
    RegisteredInit,
    RegisterReply,
    RegisterConfirmedReply,
    PowerOnReply,
    NotStartedSwipingCard,
    SearchUserValidReply,
    SearchUserInvalidReply,
    OpenWellReply,
    OpenWellDataReply,
    StartedSwipingCard,
    CloseWellReply,
}

impl DeviceEvent {
    pub const ALL: [DeviceEvent; 12] = [
        DeviceEvent::UnregisteredInit,
        DeviceEvent::RegisteredInit,
        DeviceEvent::RegisterReply,
        DeviceEvent::RegisterConfirmedReply,
        DeviceEvent::PowerOnReply,
        DeviceEvent::NotStartedSwipingCard,
        DeviceEvent::SearchUserValidReply,
        DeviceEvent::SearchUserInvalidReply,
        DeviceEvent::OpenWellReply,
        DeviceEvent::OpenWellDataReply,
        DeviceEvent::StartedSwipingCard,
        DeviceEvent::CloseWellReply,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceEvent::UnregisteredInit => "unregistered_init",
            DeviceEvent::RegisteredInit => "registered_init",
            DeviceEvent::RegisterReply => "register_reply",
            DeviceEvent::RegisterConfirmedReply => "register_confirmed_reply",
            DeviceEvent::PowerOnReply => "power_on_reply",
            DeviceEvent::NotStartedSwipingCard => "not_started_swiping_card",
            DeviceEvent::SearchUserValidReply => "search_user_valid_reply",
            DeviceEvent::SearchUserInvalidReply => "search_user_invalid_reply",
            DeviceEvent::OpenWellReply => "open_well_reply",
            DeviceEvent::OpenWellDataReply => "open_well_data_reply",
            DeviceEvent::StartedSwipingCard => "started_swiping_card",
            DeviceEvent::CloseWellReply => "close_well_reply",
        }
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect performed on arrival in a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Run one conversation with this function code
    Send(FunctionCode),
    /// Set `registered = true` and persist it
    MarkRegistered,
    /// Raise uploaded totals to the observed cumulative sums and persist them
    PersistUploadedTotals,
}

const NONE: &[Effect] = &[];

/// The transition table
///
/// Returns `None` when `event` is not accepted in `state`.
pub fn transition(
    state: DeviceState,
    event: DeviceEvent,
) -> Option<(DeviceState, &'static [Effect])> {
    use DeviceEvent as E;
    use DeviceState as S;

    let next: (DeviceState, &'static [Effect]) = match (event, state) {
        (E::UnregisteredInit, S::Initial) => {
            (S::Unregistered, &[Effect::Send(FunctionCode::Register)])
        },
        (E::RegisteredInit, S::Initial) => (S::Registered, &[Effect::Send(FunctionCode::PowerOn)]),
        (E::RegisterReply, S::Unregistered) => (
            S::UnregisteredConfirmed,
            &[Effect::Send(FunctionCode::RegisterConfirm)],
        ),
        (E::RegisterConfirmedReply, S::UnregisteredConfirmed) => (
            S::Registered,
            &[Effect::MarkRegistered, Effect::Send(FunctionCode::PowerOn)],
        ),
        (E::PowerOnReply, S::Registered) => (S::PowerOn, NONE),
        (E::NotStartedSwipingCard, S::PowerOn) => (
            S::NotStartedSwipedCard,
            &[Effect::Send(FunctionCode::SearchCard)],
        ),
        (E::SearchUserValidReply, S::NotStartedSwipedCard) => {
            (S::ValidUser, &[Effect::Send(FunctionCode::OpenWell)])
        },
        (E::SearchUserInvalidReply, S::NotStartedSwipedCard) => (S::InvalidUser, NONE),
        (E::OpenWellReply, S::ValidUser) => (S::Started, NONE),
        (E::OpenWellDataReply, S::Started) => (S::Started, NONE),
        (E::StartedSwipingCard, S::Started) => {
            (S::StartedSwipedCard, &[Effect::Send(FunctionCode::CloseWell)])
        },
        (E::CloseWellReply, S::StartedSwipedCard) => (S::PowerOn, &[Effect::PersistUploadedTotals]),
        _ => return None,
    };
    Some(next)
}

/// Outcome of a successful [`DeviceFsm::fire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub event: DeviceEvent,
    pub from: DeviceState,
    pub to: DeviceState,
    pub effects: &'static [Effect],
}

/// Per-device state holder
#[derive(Debug, Clone)]
pub struct DeviceFsm {
    state: DeviceState,
}

impl Default for DeviceFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFsm {
    pub fn new() -> Self {
        Self {
            state: DeviceState::Initial,
        }
    }

    /// Start from an arbitrary state (used to resume or to test)
    pub fn with_state(state: DeviceState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn permits(&self, event: DeviceEvent) -> bool {
        transition(self.state, event).is_some()
    }

    /// Apply `event`; on an illegal transition the state is left untouched
    pub fn fire(&mut self, event: DeviceEvent) -> Result<Transition> {
        let from = self.state;
        let (to, effects) = transition(from, event).ok_or(WellSimError::IllegalTransition {
            event,
            state: from,
        })?;
        self.state = to;
        Ok(Transition {
            event,
            from,
            to,
            effects,
        })
    }
}
