// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT transport over rumqttc.

use crate::config::{EndpointConfig, QosLevel, Scheme};
use crate::connection::{BrokerClient, ConnectionError, Transport, TransportEvent};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport as Wire,
};
use std::future::Future;
use std::time::Duration;

/// Request channel capacity between client handles and the event loop.
const REQUEST_CAPACITY: usize = 256;

fn to_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Build client options for an endpoint.
pub fn mqtt_options(endpoint: &EndpointConfig) -> Result<MqttOptions, ConnectionError> {
    let address = endpoint
        .resolve()
        .map_err(|e| ConnectionError::Endpoint(e.to_string()))?;

    let mut options = match address.scheme {
        Scheme::Ws | Scheme::Wss => {
            MqttOptions::new(endpoint.client_id.clone(), address.ws_url(), address.port)
        }
        Scheme::Tcp | Scheme::Tls => {
            MqttOptions::new(endpoint.client_id.clone(), address.host.clone(), address.port)
        }
    };

    options
        .set_keep_alive(Duration::from_secs(endpoint.keepalive_secs))
        .set_clean_session(endpoint.clean_session);

    if let Some(username) = &endpoint.username {
        options.set_credentials(username.clone(), endpoint.password.clone().unwrap_or_default());
    }

    match address.scheme {
        Scheme::Tcp => {}
        Scheme::Tls => {
            options.set_transport(Wire::tls_with_default_config());
        }
        Scheme::Ws => {
            options.set_transport(Wire::Ws);
        }
        Scheme::Wss => {
            options.set_transport(Wire::wss_with_default_config());
        }
    }

    Ok(options)
}

/// rumqttc event loop wrapped as a [`Transport`].
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttTransport {
    /// Create an unconnected transport. Nothing touches the network until
    /// the first poll.
    pub fn new(endpoint: &EndpointConfig) -> Result<Self, ConnectionError> {
        let options = mqtt_options(endpoint)?;
        tracing::debug!(
            client_id = %endpoint.client_id,
            address = %endpoint.address,
            "Creating MQTT transport"
        );
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok(Self { client, eventloop })
    }
}

impl Transport for MqttTransport {
    type Client = MqttClient;

    fn client(&self) -> MqttClient {
        MqttClient {
            inner: self.client.clone(),
        }
    }

    fn poll(&mut self) -> impl Future<Output = Result<TransportEvent, ConnectionError>> + Send {
        async move {
            let event = self
                .eventloop
                .poll()
                .await
                .map_err(|e| ConnectionError::Transport(e.to_string()))?;
            Ok(match event {
                Event::Incoming(Packet::ConnAck(_)) => TransportEvent::Connected,
                Event::Incoming(Packet::Publish(publish)) => TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                },
                Event::Outgoing(Outgoing::Disconnect) => TransportEvent::Closed,
                _ => TransportEvent::Other,
            })
        }
    }
}

/// Request handle of an [`MqttTransport`].
#[derive(Clone)]
pub struct MqttClient {
    inner: AsyncClient,
}

impl MqttClient {
    /// Publish with the retain flag set.
    pub async fn publish_retained(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> Result<(), ConnectionError> {
        self.inner
            .publish(topic, to_qos(qos), true, payload)
            .await
            .map_err(|e| ConnectionError::Client(e.to_string()))
    }
}

impl BrokerClient for MqttClient {
    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), ConnectionError> {
        self.inner
            .try_subscribe(topic, to_qos(qos))
            .map_err(|e| ConnectionError::Client(e.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.inner
            .try_unsubscribe(topic)
            .map_err(|e| ConnectionError::Client(e.to_string()))
    }

    fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        let client = self.inner.clone();
        async move {
            client
                .publish(topic, to_qos(qos), false, payload)
                .await
                .map_err(|e| ConnectionError::Client(e.to_string()))
        }
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        self.inner
            .try_disconnect()
            .map_err(|e| ConnectionError::Client(e.to_string()))
    }
}
