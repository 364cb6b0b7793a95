// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

//! Write-side state machine for a single Tag's head+content framing (spec
//! §4.3.1: `WRITING_HEAD` / `WRITING_CONTENT` / `WAIT_RESPONSE`), built on
//! the generic [`crate::state_machine`] triad the way the teacher's
//! `state_machine::write_states::WriteStates` rides `state_machine::common`.
//! The read side doesn't need an equivalent here: the Tag already carries
//! its own head/content state machine (`Tag::read_buffer`), so a Link only
//! has to sequence *which* Tag is being read, not *how*.

use std::{future::Future, pin::Pin};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    error::{BrokerError, TransportError},
    state_machine::{StateMachine, Transition},
    tag::Tag,
};

pub struct WriteCtx<'a, W> {
    pub writer: &'a mut W,
    pub tag: &'a Tag,
}

/// One write() call's worth of progress on a Tag's outgoing head+content.
#[derive(Debug, Clone, Copy)]
pub enum WriteState {
    WritingHead,
    WritingContent,
    WaitResponse,
}

impl WriteState {
    pub fn initial(tag: &Tag) -> Self {
        if tag.write_remaining() == 0 {
            WriteState::WaitResponse
        } else {
            WriteState::WritingHead
        }
    }
}

impl<'a, W> StateMachine<WriteCtx<'a, W>, Result<usize, BrokerError>> for WriteState
where
    W: AsyncWrite + Unpin + 'a,
{
    type StepResult<'s>
        = Pin<Box<dyn Future<Output = Transition<WriteState, Result<usize, BrokerError>>> + 's>>
    where
        Self: 's,
        WriteCtx<'a, W>: 's;

    fn step<'s>(&'s self, ctx: &'s mut WriteCtx<'a, W>) -> Self::StepResult<'s> {
        Box::pin(async move {
            match self {
                WriteState::WaitResponse => Transition::Done(Ok(ctx.tag.write_completed())),
                WriteState::WritingHead | WriteState::WritingContent => {
                    let buf = ctx.tag.make_write_buffer();
                    match ctx.writer.write(&buf).await {
                        Ok(0) => Transition::Done(Err(BrokerError::Transport(
                            TransportError::EofMidMessage,
                        ))),
                        Ok(n) => {
                            ctx.tag.wrote_buffer(n);
                            // Progress only covers the content region (spec
                            // §4.3.1): a write that lands entirely within
                            // the head never pushes `write_completed()`
                            // past `head_len`.
                            let head_len = ctx.tag.request.out.head.len();
                            if ctx.tag.write_completed() > head_len {
                                if let Some(cb) = &ctx.tag.request.progress {
                                    cb(n);
                                }
                            }
                            if ctx.tag.write_remaining() == 0 {
                                Transition::Next(WriteState::WaitResponse, Ok(n))
                            } else {
                                let next = if ctx.tag.write_completed() < head_len {
                                    WriteState::WritingHead
                                } else {
                                    WriteState::WritingContent
                                };
                                Transition::Next(next, Ok(n))
                            }
                        },
                        Err(e) => Transition::Done(Err(BrokerError::Transport(
                            TransportError::Io(e.to_string()),
                        ))),
                    }
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        request::{Request, RequestOptions, build_head},
        state_machine::drive,
    };

    fn opts() -> RequestOptions {
        RequestOptions {
            http_exceptions: true,
            content_length_maxalloc: 1024,
            contiguous_content: true,
            chunks_reserve: 4,
            truncate_content: false,
            priority: 0,
        }
    }

    #[tokio::test]
    async fn drives_head_then_content_to_completion() {
        let head = build_head("POST", "/x", "example.org", 3, None, &[]);
        let request = std::rc::Rc::new(Request::new(head, Bytes::from_static(b"abc"), opts()));
        let (tag, _rx) = Tag::new(0, request);

        let mut sink: Vec<u8> = Vec::new();
        let outcome = {
            let mut ctx = WriteCtx { writer: &mut sink, tag: tag.as_ref() };
            drive(WriteState::initial(&tag), &mut ctx, |_r| async {}).await
        };

        assert!(outcome.is_ok());
        assert_eq!(tag.write_remaining(), 0);
        assert!(sink.ends_with(b"abc"));
    }

    #[tokio::test]
    async fn progress_callback_only_fires_in_content_region() {
        let head = build_head("POST", "/x", "example.org", 3, None, &[]);
        let total: std::rc::Rc<std::cell::Cell<usize>> = Default::default();
        let total_cb = std::rc::Rc::clone(&total);
        let request = std::rc::Rc::new(
            Request::new(head, Bytes::from_static(b"abc"), opts())
                .with_progress(std::rc::Rc::new(move |n| total_cb.set(total_cb.get() + n))),
        );
        let head_len = request.out.head.len();
        let (tag, _rx) = Tag::new(0, request);

        let mut sink: Vec<u8> = Vec::new();
        {
            let mut ctx = WriteCtx { writer: &mut sink, tag: tag.as_ref() };
            drive(WriteState::initial(&tag), &mut ctx, |_r| async {}).await.unwrap();
        }

        // Only the 3 content bytes are reported; the head's bytes never
        // reach the progress callback.
        assert_eq!(total.get(), 3);
        assert_eq!(sink.len(), head_len + 3);
    }
}
