use async_trait::async_trait;
use serde_json::Value;

use crate::core::{
    exchange::Exchange,
    expression::UrlTemplate,
    interceptor::{Flow, Interceptor, InterceptorError, InterceptorResult, Outcome},
};

enum PropertyValue {
    Literal(Value),
    /// String values containing `${...}` are rendered per exchange.
    Template(UrlTemplate),
}

/// Stores a value in the exchange properties, where targets and later
/// interceptors can read it.
pub struct SetPropertyInterceptor {
    name: String,
    value: PropertyValue,
}

impl SetPropertyInterceptor {
    pub fn new(name: &str, value: Value) -> InterceptorResult<Self> {
        let value = match value {
            Value::String(s) if UrlTemplate::is_template(&s) => PropertyValue::Template(
                UrlTemplate::parse(&s).map_err(|e| InterceptorError::Config(e.to_string()))?,
            ),
            other => PropertyValue::Literal(other),
        };
        Ok(Self {
            name: name.to_string(),
            value,
        })
    }
}

#[async_trait]
impl Interceptor for SetPropertyInterceptor {
    fn name(&self) -> &str {
        "set_property"
    }

    fn flow(&self) -> Flow {
        Flow::REQUEST
    }

    async fn handle_request(&self, exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        let value = match &self.value {
            PropertyValue::Literal(value) => value.clone(),
            PropertyValue::Template(template) => Value::String(
                template
                    .render(exchange)
                    .map_err(|e| InterceptorError::failed(e.to_string()))?,
            ),
        };
        exchange.set_property(self.name.clone(), value);
        Ok(Outcome::Continue)
    }
}
