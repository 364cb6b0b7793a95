// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! The generic state-machine driving shape the write/read sides of a Link
//! are built on, carried over from the teacher's
//! `state_machine::common::{StateMachine, Transition}` (originally driving
//! iSCSI PDU exchanges) and generalized to drive HTTP/1.1 framing instead.

use std::future::Future;

/// The result of one state's `step`: either advance to a new state,
/// remain in the current one (more bytes needed), or terminate.
pub enum Transition<S, R> {
    Next(S, R),
    Stay(R),
    Done(R),
}

/// A single state in a state machine over `Ctx`, producing `R` on each
/// step.
pub trait StateMachine<Ctx, R>: Sized {
    type StepResult<'a>: Future<Output = Transition<Self, R>> + 'a
    where
        Self: 'a,
        Ctx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}

/// Drives `state` to completion by repeatedly calling `step`, threading the
/// state forward on `Next` and returning on `Done`. `on_stay` is invoked
/// between `Stay` transitions so the caller can yield (e.g. wait for more
/// socket readiness) instead of busy-looping.
pub async fn drive<Ctx, S, R, Fut>(
    mut state: S,
    ctx: &mut Ctx,
    mut on_stay: impl FnMut(&R) -> Fut,
) -> R
where
    S: StateMachine<Ctx, R>,
    Fut: Future<Output = ()>,
{
    loop {
        match state.step(ctx).await {
            Transition::Next(next, _r) => {
                state = next;
            },
            Transition::Stay(r) => {
                on_stay(&r).await;
            },
            Transition::Done(r) => return r,
        }
    }
}
