//! Built-in chat template renderers.
//!
//! Mirrors the classic family-based template support: a template is selected
//! either by its short identifier (`"chatml"`, `"llama3"`, ...) or by
//! sniffing distinctive markers in a full template literal, then rendered by
//! a hand-written formatter for that family.

use blama_engine::{BlamaError, ChatMsg, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TemplateFamily {
    ChatMl,
    Llama2,
    Llama2SysBos,
    Llama2SysStrip,
    MistralV1,
    MistralV3,
    MistralV3Tekken,
    MistralV7,
    Monarch,
    Gemma,
    Orion,
    Openchat,
    Vicuna,
    VicunaOrca,
    Deepseek,
    Deepseek2,
    CommandR,
    Llama3,
    ChatGlm3,
    ChatGlm4,
    GlmEdge,
    MiniCpm,
    Granite,
    Phi3,
    Phi4,
    Megrez,
    Gigachat,
}

impl TemplateFamily {
    /// Resolve a short id or sniff a full template literal.
    pub(crate) fn detect(tmpl: &str) -> Result<Self> {
        use TemplateFamily::*;

        let by_id = match tmpl {
            "chatml" => Some(ChatMl),
            "llama2" => Some(Llama2),
            "llama2-sys" | "llama2-sys-bos" => Some(Llama2SysBos),
            "llama2-sys-strip" => Some(Llama2SysStrip),
            "mistral-v1" => Some(MistralV1),
            "mistral-v3" => Some(MistralV3),
            "mistral-v3-tekken" => Some(MistralV3Tekken),
            "mistral-v7" => Some(MistralV7),
            "monarch" => Some(Monarch),
            "gemma" => Some(Gemma),
            "orion" => Some(Orion),
            "openchat" => Some(Openchat),
            "vicuna" => Some(Vicuna),
            "vicuna-orca" => Some(VicunaOrca),
            "deepseek" => Some(Deepseek),
            "deepseek2" => Some(Deepseek2),
            "command-r" => Some(CommandR),
            "llama3" => Some(Llama3),
            "chatglm3" => Some(ChatGlm3),
            "chatglm4" => Some(ChatGlm4),
            "glmedge" => Some(GlmEdge),
            "minicpm" => Some(MiniCpm),
            "granite" => Some(Granite),
            "phi3" => Some(Phi3),
            "phi4" => Some(Phi4),
            "megrez" => Some(Megrez),
            "gigachat" => Some(Gigachat),
            _ => None,
        };
        if let Some(f) = by_id {
            return Ok(f);
        }

        // full template literal: look for family-distinctive markers
        let has = |needle: &str| tmpl.contains(needle);
        let detected = if has("<|im_sep|>") {
            Some(Phi4)
        } else if has("<|im_start|>") {
            Some(ChatMl)
        } else if has("[SYSTEM_PROMPT]") {
            Some(MistralV7)
        } else if has("' [INST] ' + system_message") {
            Some(MistralV1)
        } else if has("[AVAILABLE_TOOLS]") {
            if has("\"[INST]\"") || has("'[INST]'") {
                Some(MistralV3Tekken)
            } else {
                Some(MistralV3)
            }
        } else if has("[INST]") {
            if has("<<SYS>>") || has("system_message") {
                if has("content.strip()") {
                    Some(Llama2SysStrip)
                } else if has("bos_token + '[INST]") {
                    Some(Llama2SysBos)
                } else {
                    Some(Llama2SysStrip)
                }
            } else {
                Some(Llama2)
            }
        } else if has("<start_of_turn>") {
            Some(Gemma)
        } else if has("'Human: '") {
            Some(Orion)
        } else if has("GPT4 Correct ") {
            Some(Openchat)
        } else if has("USER: ") && has("ASSISTANT: ") {
            if has("SYSTEM: ") {
                Some(VicunaOrca)
            } else {
                Some(Vicuna)
            }
        } else if has("### Instruction:") && has("<|EOT|>") {
            Some(Deepseek)
        } else if has("'User: '") {
            Some(Deepseek2)
        } else if has("<|START_OF_TURN_TOKEN|>") {
            Some(CommandR)
        } else if has("<|start_header_id|>") {
            Some(Llama3)
        } else if has("[gMASK]sop") {
            Some(ChatGlm3)
        } else if has("[gMASK]<sop>") {
            Some(ChatGlm4)
        } else if has("<用户>") {
            Some(MiniCpm)
        } else if has("<|start_of_role|>") {
            Some(Granite)
        } else if has("<|user|>") && has("<|end|>") {
            Some(Phi3)
        } else if has("<|role_start|>") {
            Some(Megrez)
        } else if has("additional_special_tokens") {
            Some(Gigachat)
        } else if has("bos_token + message['role']") {
            Some(Monarch)
        } else if has("<|user|>") {
            Some(GlmEdge)
        } else {
            None
        };

        detected.ok_or_else(|| BlamaError::Config(format!("unsupported chat template: {tmpl}")))
    }

    pub(crate) fn apply(&self, chat: &[ChatMsg], add_ass: bool) -> String {
        use TemplateFamily::*;
        match self {
            ChatMl => {
                let mut out = String::new();
                for m in chat {
                    out += &format!("<|im_start|>{}\n{}<|im_end|>\n", m.role, m.text);
                }
                if add_ass {
                    out += "<|im_start|>assistant\n";
                }
                out
            }
            Llama2 | Llama2SysBos | Llama2SysStrip => {
                let wrap_sys = *self != Llama2;
                let bos_inside = *self == Llama2SysBos;
                let strip = *self == Llama2SysStrip;
                let trim = |s: &str| {
                    if strip {
                        s.trim().to_string()
                    } else {
                        s.to_string()
                    }
                };

                let mut out = String::new();
                let mut inside_turn = false;
                let mut first_turn = true;
                for m in chat {
                    if !inside_turn && m.role != "assistant" {
                        if bos_inside && !first_turn {
                            out += "<s>";
                        }
                        out += "[INST] ";
                        inside_turn = true;
                        first_turn = false;
                    }
                    match m.role.as_str() {
                        "system" => {
                            if wrap_sys {
                                out += &format!("<<SYS>>\n{}\n<</SYS>>\n\n", trim(&m.text));
                            } else {
                                out += &format!("{}\n", m.text);
                            }
                        }
                        "assistant" => {
                            out += &format!("{}</s>", trim(&m.text));
                        }
                        _ => {
                            out += &format!("{} [/INST]", trim(&m.text));
                            inside_turn = false;
                        }
                    }
                }
                out
            }
            MistralV1 => {
                let mut out = String::new();
                let mut sys = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => sys = m.text.clone(),
                        "user" => {
                            if sys.is_empty() {
                                out += &format!(" [INST] {} [/INST]", m.text);
                            } else {
                                out += &format!(" [INST] {}\n\n{} [/INST]", sys, m.text);
                                sys.clear();
                            }
                        }
                        _ => out += &format!(" {}</s>", m.text),
                    }
                }
                out
            }
            MistralV3 => {
                let mut out = String::new();
                let mut sys = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => sys = m.text.clone(),
                        "user" => {
                            if sys.is_empty() {
                                out += &format!("[INST] {}[/INST]", m.text);
                            } else {
                                out += &format!("[INST] {}\n\n{}[/INST]", sys, m.text);
                                sys.clear();
                            }
                        }
                        _ => out += &format!(" {}</s>", m.text.trim()),
                    }
                }
                out
            }
            MistralV3Tekken => {
                let mut out = String::new();
                let mut sys = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => sys = m.text.clone(),
                        "user" => {
                            if sys.is_empty() {
                                out += &format!("[INST]{}[/INST]", m.text);
                            } else {
                                out += &format!("[INST]{}\n\n{}[/INST]", sys, m.text);
                                sys.clear();
                            }
                        }
                        _ => out += &format!("{}</s>", m.text),
                    }
                }
                out
            }
            MistralV7 => {
                let mut out = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => out += &format!("[SYSTEM_PROMPT] {}[/SYSTEM_PROMPT]", m.text),
                        "user" => out += &format!("[INST] {}[/INST]", m.text),
                        _ => out += &format!(" {}</s>", m.text),
                    }
                }
                out
            }
            Monarch => {
                let mut out = String::new();
                for (i, m) in chat.iter().enumerate() {
                    let bos = if i == 0 { "" } else { "<s>" };
                    out += &format!("{}{}\n{}</s>\n", bos, m.role, m.text);
                }
                if add_ass {
                    out += "<s>assistant\n";
                }
                out
            }
            Gemma => {
                let mut out = String::new();
                let mut sys = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => sys = m.text.trim().to_string(),
                        _ => {
                            let role = if m.role == "assistant" { "model" } else { "user" };
                            let mut text = m.text.trim().to_string();
                            if role == "user" && !sys.is_empty() {
                                text = format!("{}\n\n{}", sys, text);
                                sys.clear();
                            }
                            out += &format!("<start_of_turn>{}\n{}<end_of_turn>\n", role, text);
                        }
                    }
                }
                if add_ass {
                    out += "<start_of_turn>model\n";
                }
                out
            }
            Orion => {
                let mut out = String::new();
                let mut sys = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => sys = m.text.clone(),
                        "user" => {
                            if sys.is_empty() {
                                out += &format!("Human: {}\n\nAssistant: </s>", m.text);
                            } else {
                                out += &format!("Human: {}\n\n{}\n\nAssistant: </s>", sys, m.text);
                                sys.clear();
                            }
                        }
                        _ => out += &format!("{}</s>", m.text),
                    }
                }
                out
            }
            Openchat => {
                let mut out = String::new();
                for m in chat {
                    if m.role == "system" {
                        out += &format!("{}<|end_of_turn|>", m.text);
                    } else {
                        let role = uppercase_first(&m.role);
                        out += &format!("GPT4 Correct {}: {}<|end_of_turn|>", role, m.text);
                    }
                }
                if add_ass {
                    out += "GPT4 Correct Assistant:";
                }
                out
            }
            Vicuna | VicunaOrca => {
                let mut out = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => {
                            if *self == VicunaOrca {
                                out += &format!("SYSTEM: {}\n", m.text);
                            } else {
                                out += &format!("{}\n\n", m.text);
                            }
                        }
                        "user" => out += &format!("USER: {}\n", m.text),
                        _ => out += &format!("ASSISTANT: {}</s>\n", m.text),
                    }
                }
                if add_ass {
                    out += "ASSISTANT:";
                }
                out
            }
            Deepseek => {
                let mut out = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => out += &m.text,
                        "user" => out += &format!("### Instruction:\n{}\n", m.text),
                        _ => out += &format!("### Response:\n{}\n<|EOT|>\n", m.text),
                    }
                }
                if add_ass {
                    out += "### Response:\n";
                }
                out
            }
            Deepseek2 => {
                let mut out = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => out += &format!("{}\n\n", m.text),
                        "user" => out += &format!("User: {}\n\n", m.text),
                        _ => out += &format!("Assistant: {}<｜end▁of▁sentence｜>", m.text),
                    }
                }
                if add_ass {
                    out += "Assistant:";
                }
                out
            }
            CommandR => {
                let mut out = String::new();
                for m in chat {
                    let token = match m.role.as_str() {
                        "system" => "<|SYSTEM_TOKEN|>",
                        "user" => "<|USER_TOKEN|>",
                        _ => "<|CHATBOT_TOKEN|>",
                    };
                    out += &format!(
                        "<|START_OF_TURN_TOKEN|>{}{}<|END_OF_TURN_TOKEN|>",
                        token,
                        m.text.trim()
                    );
                }
                if add_ass {
                    out += "<|START_OF_TURN_TOKEN|><|CHATBOT_TOKEN|>";
                }
                out
            }
            Llama3 => {
                let mut out = String::new();
                for m in chat {
                    out += &format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        m.role,
                        m.text.trim()
                    );
                }
                if add_ass {
                    out += "<|start_header_id|>assistant<|end_header_id|>\n\n";
                }
                out
            }
            ChatGlm3 => {
                let mut out = String::from("[gMASK]sop");
                for m in chat {
                    out += &format!("<|{}|>\n {}", m.role, m.text);
                }
                if add_ass {
                    out += "<|assistant|>";
                }
                out
            }
            ChatGlm4 => {
                let mut out = String::from("[gMASK]<sop>");
                for m in chat {
                    out += &format!("<|{}|>\n{}", m.role, m.text);
                }
                if add_ass {
                    out += "<|assistant|>";
                }
                out
            }
            GlmEdge => {
                let mut out = String::new();
                for m in chat {
                    out += &format!("<|{}|>\n{}", m.role, m.text);
                }
                if add_ass {
                    out += "<|assistant|>";
                }
                out
            }
            MiniCpm => {
                let mut out = String::new();
                for m in chat {
                    if m.role == "user" {
                        out += &format!("<用户>{}<AI>", m.text.trim());
                    } else {
                        out += m.text.trim();
                    }
                }
                out
            }
            Granite => {
                let mut out = String::new();
                for m in chat {
                    out += &format!(
                        "<|start_of_role|>{}<|end_of_role|>{}<|end_of_text|>\n",
                        m.role, m.text
                    );
                }
                if add_ass {
                    out += "<|start_of_role|>assistant<|end_of_role|>\n";
                }
                out
            }
            Phi3 => {
                let mut out = String::new();
                for m in chat {
                    out += &format!("<|{}|>\n{}<|end|>\n", m.role, m.text);
                }
                if add_ass {
                    out += "<|assistant|>\n";
                }
                out
            }
            Phi4 => {
                let mut out = String::new();
                for m in chat {
                    match m.role.as_str() {
                        "system" => {
                            out += &format!("<|im_start|>system<|im_sep|>{}<|im_end|>", m.text)
                        }
                        "user" => {
                            out += &format!(
                                "<|im_start|>user<|im_sep|>{}<|im_end|><|im_start|>assistant<|im_sep|>",
                                m.text
                            )
                        }
                        _ => out += &format!("{}<|im_end|>", m.text),
                    }
                }
                out
            }
            Megrez => {
                let mut out = String::new();
                for m in chat {
                    out += &format!("<|role_start|>{}<|role_end|>{}<|turn_end|>", m.role, m.text);
                }
                if add_ass {
                    out += "<|role_start|>assistant<|role_end|>";
                }
                out
            }
            Gigachat => {
                let mut out = String::new();
                let mut first = true;
                for m in chat {
                    if first {
                        if m.role == "system" {
                            out += &format!("<s>{}<|message_sep|>", m.text);
                            first = false;
                            continue;
                        }
                        out += "<s>";
                        first = false;
                    }
                    match m.role.as_str() {
                        "user" => {
                            out += &format!(
                                "user<|role_sep|>{}<|message_sep|>available functions<|role_sep|>[]<|message_sep|>",
                                m.text
                            )
                        }
                        "assistant" => {
                            out += &format!("assistant<|role_sep|>{}<|message_sep|>", m.text)
                        }
                        _ => {}
                    }
                }
                if add_ass {
                    out += "assistant<|role_sep|>";
                }
                out
            }
        }
    }
}

fn uppercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
