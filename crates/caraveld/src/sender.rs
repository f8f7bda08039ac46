use crate::broker::MessageBroker;
use crate::client_pool::{LeaseOutcome, PooledClient, SmtpClientPool};
use crate::dns::MxResolver;
use crate::lifecycle::{LifeCycleHandle, ShutdownSubscription};
use crate::message::{EnvelopeAddress, QueuedMessage};
use crate::recorder::{OutcomeRecorder, DOMAIN_NOT_FOUND, TIMED_OUT_IN_QUEUE};
use crate::unavailability::UnavailabilityRegistry;
use crate::virtual_mta::VirtualMtaSelector;
use caravel_smtp::{ClientError, Response, StepFlow};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long to doze when the broker has nothing for us
const EMPTY_QUEUE_SLEEP: Duration = Duration::from_millis(100);

/// Reason recorded when the pool could not reach any MX host
const FAILED_TO_CONNECT: &str = "Failed to connect";

/// Reason recorded when a transaction dies mid-flight without a peer reply
const ABRUPT_END: &str = "Connection was established but ended abruptly.";

/// The dispatch loop: drains the broker, applies the timing and policy
/// gates, selects routing, and drives each message's SMTP transaction to a
/// recorded outcome.
pub struct MessageSender {
    broker: Arc<dyn MessageBroker>,
    resolver: Arc<dyn MxResolver>,
    selector: Arc<VirtualMtaSelector>,
    pool: Arc<SmtpClientPool>,
    recorder: Arc<OutcomeRecorder>,
    registry: Arc<UnavailabilityRegistry>,
    max_time_in_queue: chrono::Duration,
}

impl MessageSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        resolver: Arc<dyn MxResolver>,
        selector: Arc<VirtualMtaSelector>,
        pool: Arc<SmtpClientPool>,
        recorder: Arc<OutcomeRecorder>,
        registry: Arc<UnavailabilityRegistry>,
        max_time_in_queue: chrono::Duration,
    ) -> Self {
        Self {
            broker,
            resolver,
            selector,
            pool,
            recorder,
            registry,
            max_time_in_queue,
        }
    }

    /// Launch the dispatch loop on its own worker. It stops cooperatively
    /// when the lifecycle begins shutting down; an in-flight transaction
    /// always runs to completion first.
    pub fn start(self: &Arc<Self>, handle: &LifeCycleHandle) -> JoinHandle<()> {
        let sender = Arc::clone(self);
        let activity = handle.activity();
        let shutdown = handle.subscribe();
        tokio::spawn(async move {
            sender.run(shutdown).await;
            drop(activity);
        })
    }

    async fn run(&self, mut shutdown: ShutdownSubscription) {
        tracing::info!("dispatch loop running");
        while !shutdown.is_stopping() {
            match self.broker.dequeue().await {
                Ok(Some(msg)) => {
                    let id = msg.id;
                    // Internal errors stay inside the attempt boundary so
                    // one poisoned message cannot take the loop down
                    if let Err(err) = self.dispatch_attempt(msg).await {
                        tracing::error!("error dispatching {id}: {err:#}");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(EMPTY_QUEUE_SLEEP) => {}
                        _ = shutdown.shutting_down() => {}
                    }
                }
                Err(err) => {
                    tracing::error!("broker dequeue failed: {err:#}");
                    tokio::select! {
                        _ = tokio::time::sleep(EMPTY_QUEUE_SLEEP) => {}
                        _ = shutdown.shutting_down() => {}
                    }
                }
            }
        }
        tracing::info!("dispatch loop stopped");
    }

    async fn dispatch_attempt(&self, mut msg: QueuedMessage) -> anyhow::Result<()> {
        let now = Utc::now();

        // Not yet eligible: hand it back unacknowledged and let the
        // broker decide the redelivery delay
        if msg.attempt_after > now {
            return self.broker.enqueue(msg).await;
        }

        if msg.is_timed_out(self.max_time_in_queue) {
            self.recorder
                .record_failure(&mut msg, TIMED_OUT_IN_QUEUE, None, None)
                .await?;
            return self.broker.ack(&msg).await;
        }

        let sender_addr = EnvelopeAddress::parse(&msg.sender).ok();
        let recipient = EnvelopeAddress::parse(&msg.recipient).ok();
        let (sender_addr, recipient) = match (sender_addr, recipient) {
            (Some(sender), Some(recipient)) if !recipient.domain().is_empty() => {
                (sender, recipient)
            }
            _ => {
                self.recorder
                    .record_failure(&mut msg, DOMAIN_NOT_FOUND, None, None)
                    .await?;
                return self.broker.ack(&msg).await;
            }
        };

        let mx_records = match self.resolver.resolve_mx(recipient.domain()).await {
            Ok(records) if !records.is_empty() => records,
            Ok(_) => {
                self.recorder
                    .record_failure(&mut msg, DOMAIN_NOT_FOUND, None, None)
                    .await?;
                return self.broker.ack(&msg).await;
            }
            Err(err) => {
                tracing::debug!("MX lookup for {} failed: {err}", recipient.domain());
                self.recorder
                    .record_failure(&mut msg, DOMAIN_NOT_FOUND, None, None)
                    .await?;
                return self.broker.ack(&msg).await;
            }
        };

        let Some(group) = self.selector.group(&msg.group_id) else {
            let deferral_reason =
                format!("virtual MTA group {} is not configured", msg.group_id);
            self.recorder
                .record_deferral(&mut msg, &deferral_reason, None, None, false)
                .await?;
            return self.broker.ack(&msg).await;
        };
        let vmta = self
            .selector
            .vmta_for_sending(group, &mx_records[0].host)
            .clone();

        match self.pool.lease(&vmta, &mx_records).await {
            LeaseOutcome::Success(client) => {
                self.run_transaction(&mut msg, &sender_addr, &recipient, &vmta.ehlo_hostname, client)
                    .await?;
            }
            LeaseOutcome::NoMxRecords
            | LeaseOutcome::FailedToAddToQueue
            | LeaseOutcome::Unknown => {
                // Expected race outcomes; nothing recorded and no ack,
                // the broker will redeliver
                return Ok(());
            }
            LeaseOutcome::FailedToConnect => {
                self.recorder
                    .record_deferral(
                        &mut msg,
                        FAILED_TO_CONNECT,
                        Some(vmta.source_address),
                        Some(&mx_records[0].host),
                        false,
                    )
                    .await?;
            }
            LeaseOutcome::ServiceUnavailable => {
                self.recorder
                    .record_service_unavailable(&mut msg, vmta.source_address)
                    .await?;
            }
            LeaseOutcome::Throttled => {
                self.recorder
                    .record_throttle(&mut msg, vmta.source_address, &mx_records[0].host)
                    .await?;
            }
            LeaseOutcome::FailedMaxConnections => {
                // Local backoff only: nudge the next attempt out by two
                // seconds and let the broker redeliver
                msg.attempt_after = Utc::now() + chrono::Duration::seconds(2);
                return Ok(());
            }
        }

        // Unconditional once a terminal outcome has been recorded,
        // deferrals included
        self.broker.ack(&msg).await
    }

    /// HELO-or-RSET, MAIL FROM, RCPT TO, DATA, strictly in that order.
    /// The client goes back to the pool only when all four steps succeed;
    /// every abort path drops (discards) it.
    async fn run_transaction(
        &self,
        msg: &mut QueuedMessage,
        sender: &EnvelopeAddress,
        recipient: &EnvelopeAddress,
        helo_name: &str,
        mut client: PooledClient,
    ) -> anyhow::Result<()> {
        let mut refusal: Option<Response> = None;

        let result = client
            .smtp()
            .exec_helo_or_rset(helo_name, |response| {
                refusal = Some(response.clone());
                StepFlow::Abort
            })
            .await;
        if !self.settle(msg, &client, result, &mut refusal).await? {
            return Ok(());
        }

        let result = client
            .smtp()
            .exec_mail_from(sender.as_str(), |response| {
                refusal = Some(response.clone());
                StepFlow::Abort
            })
            .await;
        if !self.settle(msg, &client, result, &mut refusal).await? {
            return Ok(());
        }

        let result = client
            .smtp()
            .exec_rcpt_to(recipient.as_str(), |response| {
                refusal = Some(response.clone());
                StepFlow::Abort
            })
            .await;
        if !self.settle(msg, &client, result, &mut refusal).await? {
            return Ok(());
        }

        let result = client
            .smtp()
            .exec_data(&msg.data, |response| {
                refusal = Some(response.clone());
                StepFlow::Abort
            })
            .await;
        if !self.settle(msg, &client, result, &mut refusal).await? {
            return Ok(());
        }

        let source = client.source;
        let mx_host = client.mx_host.clone();
        self.pool.give_back(client);
        self.recorder.record_success(msg, source, &mx_host).await
    }

    /// Returns true when the transaction may proceed to the next step.
    /// Both failure shapes record their outcome here; the caller just
    /// stops, which discards the client.
    async fn settle(
        &self,
        msg: &mut QueuedMessage,
        client: &PooledClient,
        result: Result<StepFlow, ClientError>,
        refusal: &mut Option<Response>,
    ) -> anyhow::Result<bool> {
        match result {
            Ok(StepFlow::Continue) => Ok(true),
            Ok(StepFlow::Abort) => {
                let response = refusal
                    .take()
                    .expect("refused step captured the peer response");
                self.record_peer_refusal(msg, client, response).await?;
                Ok(false)
            }
            Err(err) => {
                tracing::debug!(
                    "transaction to {} via {} ended: {err}",
                    client.mx_host,
                    client.source
                );
                self.recorder
                    .record_deferral(
                        msg,
                        ABRUPT_END,
                        Some(client.source),
                        Some(&client.mx_host),
                        false,
                    )
                    .await?;
                Ok(false)
            }
        }
    }

    async fn record_peer_refusal(
        &self,
        msg: &mut QueuedMessage,
        client: &PooledClient,
        response: Response,
    ) -> anyhow::Result<()> {
        let text = response.to_single_line();
        if text.starts_with('5') {
            self.recorder
                .record_failure(msg, &text, Some(client.source), Some(&client.mx_host))
                .await
        } else if text.starts_with("421") {
            self.registry
                .add(&client.source.to_string(), &client.mx_host, Utc::now());
            self.recorder
                .record_deferral(msg, &text, Some(client.source), Some(&client.mx_host), true)
                .await
        } else {
            self.recorder
                .record_deferral(msg, &text, Some(client.source), Some(&client.mx_host), false)
                .await
        }
    }
}
