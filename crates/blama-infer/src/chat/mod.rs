//! Chat template application: legacy family renderers or a Jinja template.
//!
//! Two backends, selected at construction: a built-in renderer for the known
//! template families (short name or full template literal), and a Jinja
//! evaluator for arbitrary model-supplied templates. Both render whole
//! message arrays and single-message deltas.

mod jinja;
mod legacy;

use blama_engine::{ChatMsg, Result, TOKEN_INVALID};

use crate::model::Model;
use jinja::JinjaTemplate;
use legacy::TemplateFamily;

/// Parameters for the Jinja backend, typically discovered from a model.
#[derive(Debug, Clone, Default)]
pub struct ChatParams {
    pub chat_template: String,
    pub bos_token: String,
    pub eos_token: String,
    /// Role injected for the generation prompt (`assistant` unless the
    /// template expects otherwise).
    pub role_assistant: String,
}

#[derive(Debug)]
enum Renderer {
    Legacy(TemplateFamily),
    Jinja(JinjaTemplate),
}

/// A chat formatter bound to one template.
#[derive(Debug)]
pub struct ChatFormat {
    template: String,
    renderer: Renderer,
}

impl ChatFormat {
    /// Built-in renderer for a short template id or a known template
    /// literal.
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        let family = TemplateFamily::detect(&template)?;
        Ok(ChatFormat {
            template,
            renderer: Renderer::Legacy(family),
        })
    }

    /// Jinja renderer for an arbitrary template.
    pub fn with_params(params: ChatParams) -> Result<Self> {
        let role = if params.role_assistant.is_empty() {
            "assistant".to_string()
        } else {
            params.role_assistant
        };
        let jinja = JinjaTemplate::new(
            &params.chat_template,
            params.bos_token,
            params.eos_token,
            role,
        )?;
        Ok(ChatFormat {
            template: params.chat_template,
            renderer: Renderer::Jinja(jinja),
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Render a whole message array.
    pub fn format_chat(&self, chat: &[ChatMsg], add_assistant_prompt: bool) -> Result<String> {
        if chat.is_empty() {
            return Ok(String::new());
        }
        match &self.renderer {
            Renderer::Legacy(family) => Ok(family.apply(chat, add_assistant_prompt)),
            Renderer::Jinja(tmpl) => tmpl.apply(chat, add_assistant_prompt),
        }
    }

    /// Render the delta a newly appended message adds over the rendered
    /// history. A trailing newline of the historical rendering is preserved
    /// in front of the delta.
    pub fn format_msg(
        &self,
        msg: &ChatMsg,
        history: &[ChatMsg],
        add_assistant_prompt: bool,
    ) -> Result<String> {
        if history.is_empty() {
            return self.format_chat(std::slice::from_ref(msg), add_assistant_prompt);
        }

        let mut full = history.to_vec();
        full.push(msg.clone());

        match &self.renderer {
            Renderer::Legacy(family) => {
                let fmt_history = family.apply(history, false);
                let mut ret = String::new();
                if add_assistant_prompt && fmt_history.ends_with('\n') {
                    ret.push('\n');
                }
                let fmt_new = family.apply(&full, add_assistant_prompt);
                ret.push_str(fmt_new.get(fmt_history.len()..).unwrap_or(""));
                Ok(ret)
            }
            Renderer::Jinja(tmpl) => {
                let fmt_history = tmpl.apply(history, add_assistant_prompt)?;
                let fmt_new = tmpl.apply(&full, add_assistant_prompt)?;
                Ok(fmt_new.get(fmt_history.len()..).unwrap_or("").to_string())
            }
        }
    }

    /// Discover a model's chat parameters: the template from metadata and
    /// the BOS/EOS strings from the vocabulary. Warns when the template
    /// references a token the vocabulary lacks.
    pub fn chat_params_for_model(model: &Model) -> ChatParams {
        let mut params = ChatParams {
            role_assistant: "assistant".to_string(),
            ..ChatParams::default()
        };
        if let Some(tmpl) = model.backend().meta_value("tokenizer.chat_template") {
            params.chat_template = tmpl;
        }

        let vocab = model.vocab();
        let template = params.chat_template.clone();
        let token_str = |token, name: &str, jinja_var: &str| {
            if token == TOKEN_INVALID {
                if template.contains(jinja_var) {
                    tracing::warn!(
                        "vocab doesn't have a {name} token, jinja template won't work as intended"
                    );
                }
                String::new()
            } else {
                vocab.token_to_string_with(token, true)
            }
        };

        params.bos_token = token_str(vocab.bos(), "BOS", "bos_token");
        params.eos_token = token_str(vocab.eos(), "EOS", "eos_token");
        params
    }
}
