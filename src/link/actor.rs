//! The task that owns a [`Supervisor`] and its transport.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::Result;
use crate::link::supervisor::{LinkState, LinkStatus, LinkTimer, Supervisor};
use crate::link::transaction::{SendRequest, TransactionId, TransactionResult};
use crate::protocol::ControllerMessage;
use crate::timer::Fired;
use crate::transport::Transport;

/// Inputs accepted by the link task.
pub(crate) enum LinkCommand {
    Submit {
        request: SendRequest,
        responder: oneshot::Sender<TransactionResult>,
        reply: oneshot::Sender<Result<TransactionId>>,
    },
    Inbound(ControllerMessage),
    Cancel(TransactionId),
    LinkReset,
    SoftReset {
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<LinkStatus>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
}

/// Serializes every link input through one supervisor.
pub(crate) struct LinkActor<T> {
    transport: Arc<Mutex<T>>,
    supervisor: Supervisor,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    fired: mpsc::UnboundedReceiver<Fired<LinkTimer>>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl<T: Transport + 'static> LinkActor<T> {
    pub(crate) const fn new(
        transport: Arc<Mutex<T>>,
        supervisor: Supervisor,
        commands: mpsc::UnboundedReceiver<LinkCommand>,
        fired: mpsc::UnboundedReceiver<Fired<LinkTimer>>,
    ) -> Self {
        Self {
            transport,
            supervisor,
            commands,
            fired,
            idle_waiters: Vec::new(),
        }
    }

    /// Runs until every sender of commands is gone.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                // Controller messages win over deadlines that expire at the same time
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(fired) = self.fired.recv() => self.supervisor.on_timer(fired),
            }
            self.flush().await;
            self.wake_idle_waiters();
        }

        tracing::debug!("controller link closed");
        self.supervisor.on_link_reset();
    }

    fn handle(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Submit {
                request,
                responder,
                reply,
            } => {
                let _ = reply.send(self.supervisor.submit(request, responder));
            }
            LinkCommand::Inbound(message) => self.supervisor.on_inbound(message),
            LinkCommand::Cancel(id) => self.supervisor.cancel(id),
            LinkCommand::LinkReset => self.supervisor.on_link_reset(),
            LinkCommand::SoftReset { reply } => self.supervisor.soft_reset(reply),
            LinkCommand::Status { reply } => {
                let _ = reply.send(self.supervisor.status());
            }
            LinkCommand::WaitIdle { reply } => self.idle_waiters.push(reply),
        }
    }

    /// Releases everyone waiting for the link to become idle.
    fn wake_idle_waiters(&mut self) {
        if self.idle_waiters.is_empty() || self.supervisor.state() != LinkState::Idle {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Sends everything the supervisor queued for the controller.
    async fn flush(&mut self) {
        while let Some(message) = self.supervisor.next_outbound() {
            tracing::trace!("-> {:?}", message);
            let result = self.transport.lock().await.send(message.encode()).await;
            if let Err(e) = result {
                tracing::error!("failed to send {:?}: {}", message.function_type(), e);
                self.supervisor.on_send_failed(&message);
            }
        }
    }
}
