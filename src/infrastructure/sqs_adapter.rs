use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::{types::MessageAttributeValue, Client};
use tracing::{debug, error, info, warn};

use crate::domain::{
    error::ImportError,
    models::{ImportMessage, ReceivedMessage},
    ports::{QueueConsumer, QueuePublisher},
};

/// Message group shared by every import so a FIFO queue keeps them ordered.
pub const MESSAGE_GROUP_ID: &str = "productos-import";

/// Publisher and consumer over a single SQS queue. FIFO behaviour (group id
/// and job-id deduplication) is enabled when the queue URL ends in `.fifo`.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    fifo: bool,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        let queue_url = queue_url.into();
        let fifo = queue_url.ends_with(".fifo");
        info!("Using SQS queue: {} (fifo: {})", queue_url, fifo);
        Self { client, queue_url, fifo }
    }

    /// Uses `queue_url` when given, otherwise resolves `queue_name`.
    pub async fn connect(client: Client, queue_url: Option<String>, queue_name: &str) -> Result<Self, ImportError> {
        if let Some(url) = queue_url {
            return Ok(Self::new(client, url));
        }

        debug!("Resolving URL for SQS queue {}", queue_name);
        let response = client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to resolve SQS queue {}: {}", queue_name, e);
                ImportError::Queue(e.to_string())
            })?;
        let url = response
            .queue_url()
            .ok_or_else(|| ImportError::Queue(format!("queue {} has no URL", queue_name)))?
            .to_string();
        Ok(Self::new(client, url))
    }

    fn string_attribute(value: &str) -> Result<MessageAttributeValue, ImportError> {
        MessageAttributeValue::builder()
            .data_type("String")
            .string_value(value)
            .build()
            .map_err(|e| ImportError::Queue(e.to_string()))
    }
}

fn lease_secs(duration: Duration) -> i32 {
    duration.as_secs().min(i32::MAX as u64) as i32
}

#[async_trait]
impl QueuePublisher for SqsQueue {
    async fn publish(&self, message: &ImportMessage) -> Result<String, ImportError> {
        let body = serde_json::to_string(message).map_err(|e| {
            error!("Failed to serialize message for job {}: {}", message.job_id, e);
            ImportError::Queue(e.to_string())
        })?;
        debug!("Publishing job {} to {}", message.job_id, self.queue_url);

        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_attributes("JobId", Self::string_attribute(&message.job_id)?)
            .message_attributes("TipoArchivo", Self::string_attribute("CSV")?)
            .message_attributes("Usuario", Self::string_attribute(&message.owner)?);

        if self.fifo {
            request = request
                .message_group_id(MESSAGE_GROUP_ID)
                .message_deduplication_id(&message.job_id);
        }

        let response = request.send().await.map_err(|e| {
            error!("Failed to publish job {}: {}", message.job_id, e);
            ImportError::Queue(e.to_string())
        })?;

        let message_id = response.message_id().unwrap_or_default().to_string();
        info!("Published job {} as message {}", message.job_id, message_id);
        Ok(message_id)
    }
}

#[async_trait]
impl QueueConsumer for SqsQueue {
    async fn receive(&self, wait: Duration, visibility: Duration) -> Result<Option<ReceivedMessage>, ImportError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(lease_secs(wait))
            .visibility_timeout(lease_secs(visibility))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to receive messages from SQS: {}", e);
                ImportError::Queue(e.to_string())
            })?;

        let Some(message) = response.messages.unwrap_or_default().into_iter().next() else {
            debug!("No messages received from SQS");
            return Ok(None);
        };

        let receipt_handle = message.receipt_handle.ok_or_else(|| {
            warn!("Received message without receipt handle");
            ImportError::Queue("message without receipt handle".to_string())
        })?;
        let message_id = message.message_id.unwrap_or_default();
        if message.body.is_none() {
            warn!("Received message {} without body", message_id);
        }

        Ok(Some(ReceivedMessage {
            message_id,
            receipt_handle,
            body: message.body.unwrap_or_default(),
        }))
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), ImportError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to delete message from SQS: {}", e);
                ImportError::Queue(e.to_string())
            })?;
        debug!("Message deleted from queue");
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, visibility: Duration) -> Result<(), ImportError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(lease_secs(visibility))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to extend message visibility: {}", e);
                ImportError::Queue(e.to_string())
            })?;
        debug!("Message visibility extended by {}s", visibility.as_secs());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_clamped_to_i32() {
        assert_eq!(lease_secs(Duration::from_secs(300)), 300);
        assert_eq!(lease_secs(Duration::from_secs(u64::MAX)), i32::MAX);
    }

    #[test]
    fn attributes_are_string_typed() {
        let attr = SqsQueue::string_attribute("ana").unwrap();
        assert_eq!(attr.data_type(), "String");
        assert_eq!(attr.string_value(), Some("ana"));
    }
}
