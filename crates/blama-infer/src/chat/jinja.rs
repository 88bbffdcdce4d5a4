//! Jinja chat templates, evaluated by `minijinja`.

use blama_engine::{BlamaError, ChatMsg, Result};
use minijinja::{context, Environment, Error as JinjaError, ErrorKind, Value};
use serde::Serialize;

#[derive(Serialize)]
struct JsonMsg<'a> {
    role: &'a str,
    content: &'a str,
}

/// A compiled Jinja chat template plus the token strings it may reference.
#[derive(Debug)]
pub struct JinjaTemplate {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
    assistant_role: String,
}

impl JinjaTemplate {
    pub fn new(
        template: &str,
        bos_token: String,
        eos_token: String,
        assistant_role: String,
    ) -> Result<Self> {
        let mut env = Environment::new();
        env.add_function(
            "raise_exception",
            |msg: String| -> std::result::Result<Value, JinjaError> {
                Err(JinjaError::new(ErrorKind::InvalidOperation, msg))
            },
        );
        env.add_template_owned("chat", template.to_string())
            .map_err(|e| {
                BlamaError::Config(format!("unsupported jinja template. Error: {e}"))
            })?;

        Ok(JinjaTemplate {
            env,
            bos_token,
            eos_token,
            assistant_role,
        })
    }

    pub fn apply(&self, chat: &[ChatMsg], add_ass: bool) -> Result<String> {
        let messages: Vec<JsonMsg<'_>> = chat
            .iter()
            .map(|m| JsonMsg {
                role: &m.role,
                content: &m.text,
            })
            .collect();

        let tmpl = self
            .env
            .get_template("chat")
            .map_err(|e| BlamaError::Config(format!("unsupported jinja template. Error: {e}")))?;
        let mut result = tmpl
            .render(context! {
                messages => messages,
                add_generation_prompt => add_ass,
                bos_token => self.bos_token,
                eos_token => self.eos_token,
                assistant_role => self.assistant_role,
            })
            .map_err(|e| BlamaError::Config(format!("chat template render failed: {e}")))?;

        // Avoid double BOS/EOS around the rendering: the tokenizer adds its
        // own. Stripped here rather than disabled in the template because the
        // tokens may legitimately appear between messages.
        if !self.bos_token.is_empty() {
            if let Some(rest) = result.strip_prefix(self.bos_token.as_str()) {
                result = rest.to_string();
            }
        }
        if !self.eos_token.is_empty() {
            if let Some(rest) = result.strip_suffix(self.eos_token.as_str()) {
                result = rest.to_string();
            }
        }
        Ok(result)
    }
}
