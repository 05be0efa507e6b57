use super::BrokerConfig;

impl BrokerConfig {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("NEURONBROKER_MESSAGE_HOST")
            && !host.is_empty()
        {
            self.message.host = host;
        }

        if let Ok(user) = std::env::var("NEURONBROKER_USER")
            && !user.is_empty()
        {
            self.message.user = user;
        }

        if let Ok(password) = std::env::var("NEURONBROKER_PASSWORD")
            && !password.is_empty()
        {
            self.message.password = password;
        }

        if let Ok(server) = std::env::var("NEURONBROKER_PERSISTENCE_SERVER")
            && !server.is_empty()
        {
            self.services.persistence_server = Some(server);
        }

        if let Ok(server) = std::env::var("NEURONBROKER_INDEXING_SERVER")
            && !server.is_empty()
        {
            self.services.indexing_server = Some(server);
        }

        if let Ok(server) = std::env::var("NEURONBROKER_AGENT_SERVER")
            && !server.is_empty()
        {
            self.services.agent_server = Some(server);
        }

        if let Ok(key) = std::env::var("NEURONBROKER_API_KEY")
            && !key.is_empty()
        {
            self.services.api_key = Some(key);
        }
    }
}
