use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    BasicProperties,
};

use eventshop_rpc_core::{
    Acknowledger, IncomingMessage, MessageProperties, MessagingError, PublishOptions,
    CONTENT_ENCODING_UTF8,
};

struct DeliveryAcker(Acker);

#[async_trait]
impl Acknowledger for DeliveryAcker {
    async fn ack(&self) -> Result<(), MessagingError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::critical("Acknowledge error", e))
    }

    async fn nack(&self, requeue: bool) -> Result<(), MessagingError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| MessagingError::critical("Acknowledge error", e))
    }
}

pub(crate) fn outgoing_properties(content_type: &str, options: PublishOptions) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(content_type.into())
        .with_content_encoding(CONTENT_ENCODING_UTF8.into());
    if let Some(id) = options.correlation_id {
        props = props.with_correlation_id(id.into());
    }
    if let Some(reply_to) = options.reply_to {
        props = props.with_reply_to(reply_to.into());
    }
    props
}

pub(crate) fn incoming_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_owned()),
        content_encoding: props
            .content_encoding()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_owned()),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_owned()),
    }
}

/// Converts a lapin delivery. With manual acks an unparsable body is
/// rejected without requeue so it cannot loop.
pub(crate) async fn into_message(
    delivery: Delivery,
    no_ack: bool,
) -> Result<IncomingMessage, MessagingError> {
    // routing_key es campo, NO metodo
    let routing_key = delivery.routing_key.as_str().to_owned();
    let properties = incoming_properties(&delivery.properties);

    match IncomingMessage::new(routing_key, delivery.data, properties) {
        Ok(message) if no_ack => Ok(message),
        Ok(message) => Ok(message.with_acker(std::sync::Arc::new(DeliveryAcker(delivery.acker)))),
        Err(err) => {
            if !no_ack {
                let _ = delivery
                    .acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await;
            }
            Err(err)
        }
    }
}
